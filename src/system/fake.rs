use crate::system::
{
    System,
    SystemError,
    CommandLineOutput
};
use crate::system::util::
{
    timestamp_to_system_time,
};
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::BTreeSet;
use std::sync::
{
    Arc,
    Mutex
};
use std::io::
{
    Error,
    ErrorKind,
    Read,
    Write
};
use std::cmp::min;
use std::time::Duration;
use std::time::SystemTime;
use std::thread;

/*  Shared file content.  Clones refer to the same bytes, so a writer
    obtained from create_file and the entry in the file map stay in
    agreement. */
#[derive(Debug, Clone)]
pub struct Content(Arc<Mutex<Vec<u8>>>);

impl Content
{
    fn new() -> Self
    {
        Content(Arc::new(Mutex::new(vec![])))
    }

    fn snapshot(&self) -> Vec<u8>
    {
        self.0.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone)]
struct FileEntry
{
    content : Content,
    modified : u64,
}

struct FakeState
{
    files : HashMap<String, FileEntry>,
    dirs : HashSet<String>,
    links : HashMap<String, String>,
    now : u64,
    execution_log : Vec<Vec<String>>,
    running : usize,
    max_running : usize,
}

/*  An in-memory stand-in for the OS.  The filesystem is a flat map of
    normalized paths; parent directories spring into being when a file
    is created under them.  Subprocess execution runs a small scripted
    command set against the same in-memory tree, and keeps a log plus a
    high-water mark of concurrent executions, which tests read to check
    the scheduler's behavior. */
#[derive(Clone)]
pub struct FakeSystem
{
    state : Arc<Mutex<FakeState>>,
}

fn normalize(path : &str) -> String
{
    let mut parts = vec![];
    for component in path.split('/')
    {
        match component
        {
            "" | "." => {},
            _ => parts.push(component),
        }
    }
    parts.join("/")
}

fn parent_of(path : &str) -> String
{
    match path.rfind('/')
    {
        Some(index) => path[..index].to_string(),
        None => "".to_string(),
    }
}

impl FakeState
{
    fn ensure_parent_dirs(&mut self, path : &str)
    {
        let mut parent = parent_of(path);
        while parent != ""
        {
            self.dirs.insert(parent.clone());
            parent = parent_of(&parent);
        }
    }
}

impl FakeSystem
{
    pub fn new(timestamp : u64) -> FakeSystem
    {
        FakeSystem
        {
            state : Arc::new(Mutex::new(
                FakeState
                {
                    files : HashMap::new(),
                    dirs : HashSet::new(),
                    links : HashMap::new(),
                    now : timestamp,
                    execution_log : vec![],
                    running : 0,
                    max_running : 0,
                }))
        }
    }

    pub fn time_passes(&mut self, delta : u64)
    {
        self.state.lock().unwrap().now += delta;
    }

    /*  Every command ever passed to execute_command, in order. */
    pub fn execution_log(&self) -> Vec<Vec<String>>
    {
        self.state.lock().unwrap().execution_log.clone()
    }

    pub fn execution_count(&self) -> usize
    {
        self.state.lock().unwrap().execution_log.len()
    }

    /*  The largest number of commands that were ever in flight at
        the same moment. */
    pub fn max_concurrent_executions(&self) -> usize
    {
        self.state.lock().unwrap().max_running
    }

    pub fn read_link(&self, path : &str) -> Option<String>
    {
        self.state.lock().unwrap().links.get(&normalize(path)).cloned()
    }

    fn write_whole_file(&self, path : &str, content : Vec<u8>) -> Result<(), SystemError>
    {
        let normalized = normalize(path);
        if normalized == ""
        {
            return Err(SystemError::PathEmpty);
        }

        let mut state = self.state.lock().unwrap();
        if state.dirs.contains(&normalized)
        {
            return Err(SystemError::DirectoryInPlaceOfFile(normalized));
        }

        state.ensure_parent_dirs(&normalized);
        let now = state.now;
        let entry = Content::new();
        *entry.0.lock().unwrap() = content;
        state.files.insert(normalized, FileEntry{content : entry, modified : now});
        Ok(())
    }

    fn read_whole_file(&self, path : &str) -> Result<Vec<u8>, SystemError>
    {
        let normalized = normalize(path);
        let state = self.state.lock().unwrap();
        match state.files.get(&normalized)
        {
            Some(entry) => Ok(entry.content.snapshot()),
            None => Err(SystemError::NotFound),
        }
    }

    fn run_scripted_command(&self, command_list : &Vec<String>) -> Result<CommandLineOutput, SystemError>
    {
        if command_list.len() == 0
        {
            return Ok(CommandLineOutput::new());
        }

        let n = command_list.len();
        match command_list[0].as_str()
        {
            /*  emit <text> <dest> */
            "emit" =>
            {
                if n != 3
                {
                    return Ok(CommandLineOutput::error("emit: expected text and destination".to_string()));
                }
                self.write_whole_file(&command_list[2], command_list[1].as_bytes().to_vec())?;
                Ok(CommandLineOutput::new())
            },

            /*  concat <src>... <dest> */
            "concat" =>
            {
                if n < 2
                {
                    return Ok(CommandLineOutput::error("concat: expected sources and destination".to_string()));
                }

                let mut output = Vec::new();
                for path in command_list[1..(n-1)].iter()
                {
                    match self.read_whole_file(path)
                    {
                        Ok(mut content) => output.append(&mut content),
                        Err(_) => return Ok(CommandLineOutput::error(
                            format!("concat: file failed to open: {}", path))),
                    }
                }
                self.write_whole_file(&command_list[n-1], output)?;
                Ok(CommandLineOutput::new())
            },

            /*  copy <src> <dest> */
            "copy" =>
            {
                if n != 3
                {
                    return Ok(CommandLineOutput::error("copy: expected source and destination".to_string()));
                }
                match self.read_whole_file(&command_list[1])
                {
                    Ok(content) =>
                    {
                        self.write_whole_file(&command_list[2], content)?;
                        Ok(CommandLineOutput::new())
                    },
                    Err(_) => Ok(CommandLineOutput::error(
                        format!("copy: file failed to open: {}", command_list[1]))),
                }
            },

            /*  slow <millis> <dest>: sleeps, then writes a marker file.
                Tests use this to hold a worker busy. */
            "slow" =>
            {
                if n != 3
                {
                    return Ok(CommandLineOutput::error("slow: expected millis and destination".to_string()));
                }
                let millis =
                match command_list[1].parse::<u64>()
                {
                    Ok(millis) => millis,
                    Err(_) => return Ok(CommandLineOutput::error("slow: bad millis".to_string())),
                };
                thread::sleep(Duration::from_millis(millis));
                self.write_whole_file(&command_list[2], b"done\n".to_vec())?;
                Ok(CommandLineOutput::new())
            },

            /*  print <text>... */
            "print" =>
            {
                Ok(CommandLineOutput
                {
                    out : command_list[1..].join(" "),
                    err : "".to_string(),
                    code : Some(0),
                    success : true,
                })
            },

            /*  fail [message]... */
            "fail" =>
            {
                Ok(CommandLineOutput::error(
                    if n > 1
                    {
                        command_list[1..].join(" ")
                    }
                    else
                    {
                        "failed".to_string()
                    }))
            },

            other => Err(SystemError::CommandNotScripted(other.to_string())),
        }
    }
}

/*  A handle to shared file content.  Reads walk a cursor over a
    snapshot-consistent view, writes go straight through to the shared
    bytes. */
#[derive(Debug)]
pub struct FakeFile
{
    content : Content,
    position : usize,
}

impl Read for FakeFile
{
    fn read(&mut self, buffer : &mut [u8]) -> Result<usize, Error>
    {
        let bytes = self.content.0.lock().unwrap();
        if self.position >= bytes.len()
        {
            return Ok(0);
        }
        let count = min(buffer.len(), bytes.len() - self.position);
        buffer[..count].copy_from_slice(&bytes[self.position..self.position + count]);
        self.position += count;
        Ok(count)
    }
}

impl Write for FakeFile
{
    fn write(&mut self, buffer : &[u8]) -> Result<usize, Error>
    {
        let mut bytes = self.content.0.lock().unwrap();
        if self.position > bytes.len()
        {
            return Err(Error::new(ErrorKind::Other, "write past end of fake file"));
        }
        let overlap = min(bytes.len() - self.position, buffer.len());
        bytes[self.position..self.position + overlap].copy_from_slice(&buffer[..overlap]);
        bytes.extend_from_slice(&buffer[overlap..]);
        self.position += buffer.len();
        Ok(buffer.len())
    }

    fn flush(&mut self) -> Result<(), Error>
    {
        Ok(())
    }
}

impl System for FakeSystem
{
    type File = FakeFile;

    fn open(&self, path : &str) -> Result<Self::File, SystemError>
    {
        let normalized = normalize(path);
        let state = self.state.lock().unwrap();
        if state.dirs.contains(&normalized)
        {
            return Err(SystemError::DirectoryInPlaceOfFile(normalized));
        }
        match state.files.get(&normalized)
        {
            Some(entry) => Ok(FakeFile{content : entry.content.clone(), position : 0}),
            None => Err(SystemError::NotFound),
        }
    }

    fn create_file(&mut self, path : &str) -> Result<Self::File, SystemError>
    {
        let normalized = normalize(path);
        if normalized == ""
        {
            return Err(SystemError::PathEmpty);
        }

        let mut state = self.state.lock().unwrap();
        if state.dirs.contains(&normalized)
        {
            return Err(SystemError::DirectoryInPlaceOfFile(normalized));
        }

        state.ensure_parent_dirs(&normalized);
        let now = state.now;
        let content = Content::new();
        state.files.insert(normalized, FileEntry{content : content.clone(), modified : now});
        Ok(FakeFile{content : content, position : 0})
    }

    fn create_dir_all(&mut self, path : &str) -> Result<(), SystemError>
    {
        let normalized = normalize(path);
        let mut state = self.state.lock().unwrap();
        if state.files.contains_key(&normalized)
        {
            return Err(SystemError::FileInPlaceOfDirectory(normalized));
        }
        if normalized != ""
        {
            state.ensure_parent_dirs(&normalized);
            state.dirs.insert(normalized);
        }
        Ok(())
    }

    fn is_dir(&self, path : &str) -> bool
    {
        let normalized = normalize(path);
        if normalized == ""
        {
            return true;
        }
        self.state.lock().unwrap().dirs.contains(&normalized)
    }

    fn is_file(&self, path : &str) -> bool
    {
        self.state.lock().unwrap().files.contains_key(&normalize(path))
    }

    fn list_dir(&self, path : &str) -> Result<Vec<String>, SystemError>
    {
        let normalized = normalize(path);
        let state = self.state.lock().unwrap();

        if normalized != "" && !state.dirs.contains(&normalized)
        {
            return Err(SystemError::NotFound);
        }

        let mut children = BTreeSet::new();
        for known in state.files.keys().chain(state.dirs.iter()).chain(state.links.keys())
        {
            if parent_of(known) == normalized && *known != normalized
            {
                children.insert(known.clone());
            }
        }

        Ok(children.into_iter().collect())
    }

    fn remove_file(&mut self, path : &str) -> Result<(), SystemError>
    {
        let normalized = normalize(path);
        let mut state = self.state.lock().unwrap();
        if state.dirs.contains(&normalized)
        {
            return Err(SystemError::RemoveFileFoundDir);
        }
        match state.files.remove(&normalized)
        {
            Some(_entry) => Ok(()),
            None =>
            {
                match state.links.remove(&normalized)
                {
                    Some(_target) => Ok(()),
                    None => Err(SystemError::NotFound),
                }
            }
        }
    }

    fn remove_dir(&mut self, path : &str) -> Result<(), SystemError>
    {
        let normalized = normalize(path);
        let mut state = self.state.lock().unwrap();
        if state.files.contains_key(&normalized)
        {
            return Err(SystemError::RemoveDirFoundFile);
        }
        if !state.dirs.contains(&normalized)
        {
            return Err(SystemError::NotFound);
        }

        let prefix = format!("{}/", normalized);
        state.files.retain(|key, _value| !key.starts_with(&prefix));
        state.links.retain(|key, _value| !key.starts_with(&prefix));
        state.dirs.retain(|key| !key.starts_with(&prefix));
        state.dirs.remove(&normalized);
        Ok(())
    }

    fn rename(&mut self, from : &str, to : &str) -> Result<(), SystemError>
    {
        let from = normalize(from);
        let to = normalize(to);
        let mut state = self.state.lock().unwrap();

        if let Some(entry) = state.files.remove(&from)
        {
            state.ensure_parent_dirs(&to);
            state.files.insert(to, entry);
            return Ok(());
        }

        if state.dirs.contains(&from)
        {
            let prefix = format!("{}/", from);
            let moved : Vec<(String, FileEntry)> = state.files
                .iter()
                .filter(|(key, _value)| key.starts_with(&prefix))
                .map(|(key, value)| (format!("{}/{}", to, &key[prefix.len()..]), value.clone()))
                .collect();
            state.files.retain(|key, _value| !key.starts_with(&prefix));
            let moved_dirs : Vec<String> = state.dirs
                .iter()
                .filter(|key| key.starts_with(&prefix))
                .map(|key| format!("{}/{}", to, &key[prefix.len()..]))
                .collect();
            state.dirs.retain(|key| !key.starts_with(&prefix));
            state.dirs.remove(&from);

            state.ensure_parent_dirs(&to);
            state.dirs.insert(to);
            for (key, value) in moved
            {
                state.files.insert(key, value);
            }
            for key in moved_dirs
            {
                state.dirs.insert(key);
            }
            return Ok(());
        }

        Err(SystemError::NotFound)
    }

    fn symlink(&mut self, original : &str, link : &str) -> Result<(), SystemError>
    {
        let link = normalize(link);
        if link == ""
        {
            return Err(SystemError::PathEmpty);
        }
        let mut state = self.state.lock().unwrap();
        state.ensure_parent_dirs(&link);
        state.links.insert(link, normalize(original));
        Ok(())
    }

    fn get_modified(&self, path : &str) -> Result<SystemTime, SystemError>
    {
        let state = self.state.lock().unwrap();
        match state.files.get(&normalize(path))
        {
            Some(entry) => Ok(timestamp_to_system_time(entry.modified)),
            None => Err(SystemError::ModifiedNotFound),
        }
    }

    fn execute_command(
        &mut self,
        command_list : Vec<String>,
        _timeout_ms : Option<u64>) -> Result<CommandLineOutput, SystemError>
    {
        {
            let mut state = self.state.lock().unwrap();
            state.execution_log.push(command_list.clone());
            state.running += 1;
            if state.running > state.max_running
            {
                state.max_running = state.running;
            }
        }

        let result = self.run_scripted_command(&command_list);

        {
            let mut state = self.state.lock().unwrap();
            state.running -= 1;
        }

        result
    }
}

#[cfg(test)]
mod test
{
    use crate::system::fake::FakeSystem;
    use crate::system::System;
    use crate::system::SystemError;
    use crate::system::util::
    {
        write_str_to_file,
        read_file_to_string,
    };

    #[test]
    fn create_file_makes_parent_directories()
    {
        let mut system = FakeSystem::new(10);
        write_str_to_file(&mut system, "a/b/c.txt", "deep content").unwrap();
        assert!(system.is_dir("a"));
        assert!(system.is_dir("a/b"));
        assert!(system.is_file("a/b/c.txt"));
    }

    #[test]
    fn list_dir_returns_sorted_children()
    {
        let mut system = FakeSystem::new(10);
        write_str_to_file(&mut system, "pkg/zebra.c", "z").unwrap();
        write_str_to_file(&mut system, "pkg/apple.c", "a").unwrap();
        system.create_dir_all("pkg/sub").unwrap();

        assert_eq!(
            system.list_dir("pkg").unwrap(),
            vec!["pkg/apple.c".to_string(), "pkg/sub".to_string(), "pkg/zebra.c".to_string()]);
    }

    #[test]
    fn list_dir_of_missing_directory_errors()
    {
        let system = FakeSystem::new(10);
        match system.list_dir("nowhere")
        {
            Ok(_) => panic!("Unexpected listing of missing directory"),
            Err(SystemError::NotFound) => {},
            Err(error) => panic!("Wrong error: {}", error),
        }
    }

    #[test]
    fn rename_moves_file_content()
    {
        let mut system = FakeSystem::new(10);
        write_str_to_file(&mut system, "old.txt", "payload").unwrap();
        system.rename("old.txt", "new/place.txt").unwrap();
        assert!(!system.is_file("old.txt"));
        assert_eq!(read_file_to_string(&system, "new/place.txt").unwrap(), "payload");
    }

    #[test]
    fn remove_dir_removes_nested_entries()
    {
        let mut system = FakeSystem::new(10);
        write_str_to_file(&mut system, "top/nested/file.txt", "x").unwrap();
        system.remove_dir("top").unwrap();
        assert!(!system.is_dir("top"));
        assert!(!system.is_file("top/nested/file.txt"));
    }

    #[test]
    fn scripted_emit_and_concat()
    {
        let mut system = FakeSystem::new(10);
        system.execute_command(
            vec!["emit".to_string(), "one\n".to_string(), "one.txt".to_string()], None).unwrap();
        system.execute_command(
            vec!["emit".to_string(), "two\n".to_string(), "two.txt".to_string()], None).unwrap();
        let output = system.execute_command(
            vec![
                "concat".to_string(),
                "one.txt".to_string(),
                "two.txt".to_string(),
                "both.txt".to_string()], None).unwrap();

        assert!(output.success);
        assert_eq!(read_file_to_string(&system, "both.txt").unwrap(), "one\ntwo\n");
        assert_eq!(system.execution_count(), 3);
    }

    #[test]
    fn scripted_fail_reports_failure()
    {
        let mut system = FakeSystem::new(10);
        let output = system.execute_command(
            vec!["fail".to_string(), "on purpose".to_string()], None).unwrap();
        assert!(!output.success);
        assert_eq!(output.code, Some(1));
        assert_eq!(output.err, "on purpose");
    }

    #[test]
    fn unscripted_command_is_an_error()
    {
        let mut system = FakeSystem::new(10);
        match system.execute_command(vec!["frobnicate".to_string()], None)
        {
            Ok(_) => panic!("Unexpected success of unscripted command"),
            Err(SystemError::CommandNotScripted(name)) => assert_eq!(name, "frobnicate"),
            Err(error) => panic!("Wrong error: {}", error),
        }
    }

    #[test]
    fn symlink_recorded()
    {
        let mut system = FakeSystem::new(10);
        write_str_to_file(&mut system, "gen/out.txt", "content").unwrap();
        system.symlink("gen/out.txt", "last/out.txt").unwrap();
        assert_eq!(system.read_link("last/out.txt"), Some("gen/out.txt".to_string()));
    }

    #[test]
    fn clone_shares_the_same_tree()
    {
        let mut system = FakeSystem::new(10);
        let mut clone = system.clone();
        write_str_to_file(&mut system, "shared.txt", "visible to clones").unwrap();
        assert_eq!(read_file_to_string(&clone, "shared.txt").unwrap(), "visible to clones");

        clone.remove_file("shared.txt").unwrap();
        assert!(!system.is_file("shared.txt"));
    }
}
