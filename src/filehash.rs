use crate::fingerprint::
{
    Fingerprint,
    FingerprintFactory,
};
use crate::system::
{
    ReadWriteError,
    System,
};
use std::collections::HashMap;
use std::sync::
{
    Arc,
    Mutex,
};

/*  PATHS_AND_CONTENTS hashes what is in the file; PATHS_ONLY hashes
    the path string itself, trading correctness on content changes for
    speed, which some callers want for enormous trees. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMode
{
    PathsAndContents,
    PathsOnly,
}

impl HashMode
{
    pub fn from_config_value(text : &str) -> HashMode
    {
        match text
        {
            "paths_only" => HashMode::PathsOnly,
            _ => HashMode::PathsAndContents,
        }
    }
}

/*  The content-hash provider at the OS boundary.  Clones share one
    cache; entries are invalidated when the caller observes a write to
    the path (the engine does this for every output it materializes). */
#[derive(Clone)]
pub struct FileHashCache<SystemType : System>
{
    system : SystemType,
    mode : HashMode,
    cache : Arc<Mutex<HashMap<String, Fingerprint>>>,
}

impl<SystemType : System> FileHashCache<SystemType>
{
    pub fn new(system : SystemType, mode : HashMode) -> FileHashCache<SystemType>
    {
        FileHashCache
        {
            system : system,
            mode : mode,
            cache : Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn mode(&self) -> HashMode
    {
        self.mode
    }

    pub fn get(&self, path : &str) -> Result<Fingerprint, ReadWriteError>
    {
        {
            let cache = self.cache.lock().unwrap();
            match cache.get(path)
            {
                Some(fingerprint) => return Ok(*fingerprint),
                None => {},
            }
        }

        let fingerprint =
        match self.mode
        {
            HashMode::PathsAndContents =>
                FingerprintFactory::from_path(&self.system, path)?.result(),

            HashMode::PathsOnly =>
            {
                let mut factory = FingerprintFactory::from_str("path-only\n");
                factory.input_str(path);
                factory.result()
            },
        };

        self.cache.lock().unwrap().insert(path.to_string(), fingerprint);
        Ok(fingerprint)
    }

    /*  Whether the cached entry for the path still matches what a
        fresh hash would produce.  Missing entries count as matching. */
    pub fn entry_still_valid(&self, path : &str, expected : &Fingerprint) -> bool
    {
        self.invalidate(path);
        match self.get(path)
        {
            Ok(fresh) => fresh == *expected,
            Err(_error) => false,
        }
    }

    pub fn invalidate(&self, path : &str)
    {
        self.cache.lock().unwrap().remove(path);
    }

    pub fn invalidate_all(&self)
    {
        self.cache.lock().unwrap().clear();
    }
}
