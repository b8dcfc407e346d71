extern crate bincode;
extern crate reqwest;
extern crate serde;

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
use crate::system::util::
{
    read_file,
    write_file,
};
use serde::{Serialize, Deserialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::
{
    Arc,
    Mutex,
};
use std::thread;
use std::time::Duration;

/*  One output file inside an artifact blob. */
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BundleFile
{
    pub path : String,
    pub content : Vec<u8>,
}

/*  The blob an artifact cache stores: every output of one rule, in a
    stable order.  The wire form is the bincode encoding. */
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Bundle
{
    pub files : Vec<BundleFile>,
}

impl Bundle
{
    pub fn gather<SystemType : System>(
        system : &SystemType,
        paths : &Vec<String>) -> Result<Bundle, ReadWriteError>
    {
        let mut files = vec![];
        for path in paths
        {
            files.push(BundleFile
            {
                path : path.clone(),
                content : read_file(system, path)?,
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Bundle{files : files})
    }

    pub fn materialize<SystemType : System>(
        &self,
        system : &mut SystemType) -> Result<(), ReadWriteError>
    {
        for file in &self.files
        {
            write_file(system, &file.path, &file.content)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CacheError>
    {
        match bincode::serialize(self)
        {
            Ok(bytes) => Ok(bytes),
            Err(error) => Err(CacheError::Encoding(error.to_string())),
        }
    }

    pub fn from_bytes(bytes : &[u8]) -> Result<Bundle, CacheError>
    {
        match bincode::deserialize(bytes)
        {
            Ok(bundle) => Ok(bundle),
            Err(error) => Err(CacheError::Encoding(error.to_string())),
        }
    }

    /*  The content digest recorded in the metadata at upload time and
        re-checked on every hit. */
    pub fn fingerprint(&self) -> Fingerprint
    {
        let mut factory = FingerprintFactory::from_str("bundle\n");
        for file in &self.files
        {
            factory.input_str(&file.path);
            factory.input_str("\x1f");
            factory.input_bytes(&file.content);
            factory.input_str("\x1e");
        }
        factory.result()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ArtifactMetadata
{
    pub origin : String,
    pub content_hash : Fingerprint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource
{
    Memory,
    LocalDisk,
    Remote,
}

impl fmt::Display for CacheSource
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            CacheSource::Memory => write!(formatter, "memory"),
            CacheSource::LocalDisk => write!(formatter, "local"),
            CacheSource::Remote => write!(formatter, "remote"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheError
{
    Encoding(String),
    Storage(String),
    Network(String),
    IntegrityMismatch(Fingerprint),
}

impl fmt::Display for CacheError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            CacheError::Encoding(message) =>
                write!(formatter, "Artifact failed to encode or decode: {}", message),

            CacheError::Storage(message) =>
                write!(formatter, "Artifact cache storage failed: {}", message),

            CacheError::Network(message) =>
                write!(formatter, "Artifact cache request failed: {}", message),

            CacheError::IntegrityMismatch(key) =>
                write!(formatter, "Artifact content hash does not match its metadata for key {}", key),
        }
    }
}

#[derive(Debug)]
pub enum CacheResult
{
    Hit
    {
        source : CacheSource,
        metadata : ArtifactMetadata,
        bundle : Bundle,
    },
    Miss,
    Error(CacheError),
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Containment
{
    Yes,
    No,
    Unknown,
}

/*  A map from rule key to artifact blob.  Stores are append-only;
    fetch is keyed by rule key. */
pub trait ArtifactCache : Send + Sync
{
    fn fetch(&self, key : &Fingerprint) -> CacheResult;

    fn store(
        &self,
        key : &Fingerprint,
        metadata : &ArtifactMetadata,
        bundle : &Bundle) -> Result<(), CacheError>;

    fn contains(&self, key : &Fingerprint) -> Containment;

    fn source(&self) -> CacheSource;
}

/*  Used when caching is switched off: every probe is Ignored, every
    store vanishes. */
pub struct NoopCache
{
}

impl ArtifactCache for NoopCache
{
    fn fetch(&self, _key : &Fingerprint) -> CacheResult
    {
        CacheResult::Ignored
    }

    fn store(
        &self,
        _key : &Fingerprint,
        _metadata : &ArtifactMetadata,
        _bundle : &Bundle) -> Result<(), CacheError>
    {
        Ok(())
    }

    fn contains(&self, _key : &Fingerprint) -> Containment
    {
        Containment::Unknown
    }

    fn source(&self) -> CacheSource
    {
        CacheSource::Memory
    }
}

#[derive(Clone)]
pub struct MemoryCache
{
    entries : Arc<Mutex<HashMap<Fingerprint, (ArtifactMetadata, Bundle)>>>,
}

impl MemoryCache
{
    pub fn new() -> MemoryCache
    {
        MemoryCache
        {
            entries : Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn len(&self) -> usize
    {
        self.entries.lock().unwrap().len()
    }
}

impl ArtifactCache for MemoryCache
{
    fn fetch(&self, key : &Fingerprint) -> CacheResult
    {
        match self.entries.lock().unwrap().get(key)
        {
            Some((metadata, bundle)) => CacheResult::Hit
            {
                source : CacheSource::Memory,
                metadata : metadata.clone(),
                bundle : bundle.clone(),
            },
            None => CacheResult::Miss,
        }
    }

    fn store(
        &self,
        key : &Fingerprint,
        metadata : &ArtifactMetadata,
        bundle : &Bundle) -> Result<(), CacheError>
    {
        self.entries.lock().unwrap().insert(*key, (metadata.clone(), bundle.clone()));
        Ok(())
    }

    fn contains(&self, key : &Fingerprint) -> Containment
    {
        if self.entries.lock().unwrap().contains_key(key)
        {
            Containment::Yes
        }
        else
        {
            Containment::No
        }
    }

    fn source(&self) -> CacheSource
    {
        CacheSource::Memory
    }
}

/*  The on-disk cache: one file per rule key under the cache root,
    holding bincode(metadata, bundle).  Persists across commands. */
#[derive(Clone)]
pub struct DirCache<SystemType : System>
{
    system : SystemType,
    root : String,
}

impl<SystemType : System> DirCache<SystemType>
{
    pub fn new(system : SystemType, root : &str) -> DirCache<SystemType>
    {
        DirCache
        {
            system : system,
            root : root.to_string(),
        }
    }

    fn entry_path(&self, key : &Fingerprint) -> String
    {
        format!("{}/{}", self.root, key.human_readable())
    }
}

impl<SystemType : System> ArtifactCache for DirCache<SystemType>
{
    fn fetch(&self, key : &Fingerprint) -> CacheResult
    {
        let path = self.entry_path(key);
        if !self.system.is_file(&path)
        {
            return CacheResult::Miss;
        }

        let bytes =
        match read_file(&self.system, &path)
        {
            Ok(bytes) => bytes,
            Err(error) => return CacheResult::Error(CacheError::Storage(format!("{}", error))),
        };

        match bincode::deserialize::<(ArtifactMetadata, Bundle)>(&bytes)
        {
            Ok((metadata, bundle)) => CacheResult::Hit
            {
                source : CacheSource::LocalDisk,
                metadata : metadata,
                bundle : bundle,
            },
            Err(error) => CacheResult::Error(CacheError::Encoding(error.to_string())),
        }
    }

    fn store(
        &self,
        key : &Fingerprint,
        metadata : &ArtifactMetadata,
        bundle : &Bundle) -> Result<(), CacheError>
    {
        let bytes =
        match bincode::serialize(&(metadata, bundle))
        {
            Ok(bytes) => bytes,
            Err(error) => return Err(CacheError::Encoding(error.to_string())),
        };

        let mut system = self.system.clone();
        match system.create_dir_all(&self.root)
        {
            Ok(()) => {},
            Err(error) => return Err(CacheError::Storage(format!("{}", error))),
        }

        match write_file(&mut system, &self.entry_path(key), &bytes)
        {
            Ok(()) => Ok(()),
            Err(error) => Err(CacheError::Storage(format!("{}", error))),
        }
    }

    fn contains(&self, key : &Fingerprint) -> Containment
    {
        if self.system.is_file(&self.entry_path(key))
        {
            Containment::Yes
        }
        else
        {
            Containment::No
        }
    }

    fn source(&self) -> CacheSource
    {
        CacheSource::LocalDisk
    }
}

static HTTP_RETRIES : usize = 3;
static HTTP_BACKOFF_BASE_MS : u64 = 50;

/*  A remote artifact cache over the HTTP wire contract:
    GET/PUT/HEAD {base}/artifact/{key}, body = bincode(metadata, blob).
    Transient request failures retry with bounded exponential backoff;
    whatever is left after that degrades to a miss upstream. */
pub struct HttpCache
{
    base_url : String,
    client : reqwest::blocking::Client,
}

impl HttpCache
{
    pub fn new(base_url : &str) -> HttpCache
    {
        HttpCache
        {
            base_url : base_url.trim_end_matches('/').to_string(),
            client : reqwest::blocking::Client::new(),
        }
    }

    fn artifact_url(&self, key : &Fingerprint) -> String
    {
        format!("{}/artifact/{}", self.base_url, key.human_readable())
    }

    fn with_retries<T, Operation>(&self, mut operation : Operation) -> Result<T, CacheError>
        where Operation : FnMut() -> Result<T, CacheError>
    {
        let mut delay = HTTP_BACKOFF_BASE_MS;
        let mut last_error = CacheError::Network("no attempts made".to_string());
        for attempt in 0..HTTP_RETRIES
        {
            match operation()
            {
                Ok(value) => return Ok(value),
                Err(error) =>
                {
                    last_error = error;
                    if attempt + 1 < HTTP_RETRIES
                    {
                        thread::sleep(Duration::from_millis(delay));
                        delay *= 2;
                    }
                },
            }
        }
        Err(last_error)
    }
}

impl ArtifactCache for HttpCache
{
    fn fetch(&self, key : &Fingerprint) -> CacheResult
    {
        let url = self.artifact_url(key);
        let outcome = self.with_retries(
            ||
            {
                match self.client.get(&url).send()
                {
                    Ok(response) =>
                    {
                        if response.status() == reqwest::StatusCode::NOT_FOUND
                        {
                            return Ok(None);
                        }
                        if !response.status().is_success()
                        {
                            return Err(CacheError::Network(
                                format!("fetch returned status {}", response.status())));
                        }
                        match response.bytes()
                        {
                            Ok(bytes) => Ok(Some(bytes.to_vec())),
                            Err(error) => Err(CacheError::Network(error.to_string())),
                        }
                    },
                    Err(error) => Err(CacheError::Network(error.to_string())),
                }
            });

        match outcome
        {
            Ok(None) => CacheResult::Miss,
            Ok(Some(bytes)) =>
            {
                match bincode::deserialize::<(ArtifactMetadata, Bundle)>(&bytes)
                {
                    Ok((metadata, bundle)) => CacheResult::Hit
                    {
                        source : CacheSource::Remote,
                        metadata : metadata,
                        bundle : bundle,
                    },
                    Err(error) => CacheResult::Error(CacheError::Encoding(error.to_string())),
                }
            },
            Err(error) => CacheResult::Error(error),
        }
    }

    fn store(
        &self,
        key : &Fingerprint,
        metadata : &ArtifactMetadata,
        bundle : &Bundle) -> Result<(), CacheError>
    {
        let bytes =
        match bincode::serialize(&(metadata, bundle))
        {
            Ok(bytes) => bytes,
            Err(error) => return Err(CacheError::Encoding(error.to_string())),
        };

        let url = self.artifact_url(key);
        self.with_retries(
            ||
            {
                match self.client.put(&url).body(bytes.clone()).send()
                {
                    Ok(response) =>
                    {
                        if response.status().is_success()
                        {
                            Ok(())
                        }
                        else
                        {
                            Err(CacheError::Network(
                                format!("store returned status {}", response.status())))
                        }
                    },
                    Err(error) => Err(CacheError::Network(error.to_string())),
                }
            })
    }

    fn contains(&self, key : &Fingerprint) -> Containment
    {
        let url = self.artifact_url(key);
        match self.client.head(&url).send()
        {
            Ok(response) =>
            {
                if response.status().is_success()
                {
                    Containment::Yes
                }
                else if response.status() == reqwest::StatusCode::NOT_FOUND
                {
                    Containment::No
                }
                else
                {
                    Containment::Unknown
                }
            },
            Err(_error) => Containment::Unknown,
        }
    }

    fn source(&self) -> CacheSource
    {
        CacheSource::Remote
    }
}

/*  Backing stores composed as a cascade: fetch walks the layers in
    order, verifies the blob against its metadata hash, and promotes a
    hit into the layers in front of where it was found.  A corrupted
    entry reads as a miss and surfaces a CacheError. */
pub struct LayeredCache
{
    layers : Vec<Box<dyn ArtifactCache>>,
}

impl LayeredCache
{
    pub fn new(layers : Vec<Box<dyn ArtifactCache>>) -> LayeredCache
    {
        LayeredCache{layers : layers}
    }
}

impl ArtifactCache for LayeredCache
{
    fn fetch(&self, key : &Fingerprint) -> CacheResult
    {
        let mut first_error = None;
        for (index, layer) in self.layers.iter().enumerate()
        {
            match layer.fetch(key)
            {
                CacheResult::Hit{source, metadata, bundle} =>
                {
                    if bundle.fingerprint() != metadata.content_hash
                    {
                        if first_error.is_none()
                        {
                            first_error = Some(CacheError::IntegrityMismatch(*key));
                        }
                        continue;
                    }

                    for earlier in &self.layers[..index]
                    {
                        match earlier.store(key, &metadata, &bundle)
                        {
                            Ok(()) => {},
                            Err(_error) => {},
                        }
                    }

                    return CacheResult::Hit
                    {
                        source : source,
                        metadata : metadata,
                        bundle : bundle,
                    };
                },
                CacheResult::Miss => {},
                CacheResult::Ignored => {},
                CacheResult::Error(error) =>
                {
                    if first_error.is_none()
                    {
                        first_error = Some(error);
                    }
                },
            }
        }

        match first_error
        {
            Some(error) => CacheResult::Error(error),
            None => CacheResult::Miss,
        }
    }

    fn store(
        &self,
        key : &Fingerprint,
        metadata : &ArtifactMetadata,
        bundle : &Bundle) -> Result<(), CacheError>
    {
        let mut first_error = None;
        for layer in &self.layers
        {
            match layer.store(key, metadata, bundle)
            {
                Ok(()) => {},
                Err(error) =>
                {
                    if first_error.is_none()
                    {
                        first_error = Some(error);
                    }
                },
            }
        }
        match first_error
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn contains(&self, key : &Fingerprint) -> Containment
    {
        for layer in &self.layers
        {
            match layer.contains(key)
            {
                Containment::Yes => return Containment::Yes,
                Containment::No => {},
                Containment::Unknown => {},
            }
        }
        Containment::No
    }

    fn source(&self) -> CacheSource
    {
        match self.layers.first()
        {
            Some(layer) => layer.source(),
            None => CacheSource::Memory,
        }
    }
}
