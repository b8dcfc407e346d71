use std::str::from_utf8;
use std::process::Output;
use std::io;
use std::fmt;
use std::time::SystemTime;

#[cfg(test)]
pub mod fake;

pub mod util;

pub mod real;

pub struct CommandLineOutput
{
    pub out : String,
    pub err : String,
    pub code : Option<i32>,
    pub success : bool,
}

pub enum ReadWriteError
{
    IOError(io::Error),
    SystemError(SystemError)
}

impl fmt::Display for ReadWriteError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            ReadWriteError::IOError(error)
                => write!(formatter, "{}", error),

            ReadWriteError::SystemError(error)
                => write!(formatter, "{}", error),
        }
    }
}

impl fmt::Debug for ReadWriteError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        write!(formatter, "{}", self)
    }
}

impl CommandLineOutput
{
    pub fn new() -> CommandLineOutput
    {
        CommandLineOutput
        {
            out : "".to_string(),
            err : "".to_string(),
            code : Some(0),
            success : true,
        }
    }

    pub fn error(message : String) -> CommandLineOutput
    {
        CommandLineOutput
        {
            out : "".to_string(),
            err : message,
            code : Some(1),
            success : false,
        }
    }

    pub fn from_output(output : Output) -> CommandLineOutput
    {
        CommandLineOutput
        {
            out : match from_utf8(&output.stdout)
            {
                Ok(text) => text,
                Err(_) => "<non-utf8 data>",
            }.to_string(),

            err : match from_utf8(&output.stderr)
            {
                Ok(text) => text,
                Err(_) => "<non-utf8 data>",
            }.to_string(),

            code : output.status.code(),
            success : output.status.success(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SystemError
{
    NotFound,
    AlreadyExists(String),
    FileInPlaceOfDirectory(String),
    DirectoryInPlaceOfFile(String),
    PathEmpty,
    RemoveFileFoundDir,
    RemoveDirFoundFile,
    ModifiedNotFound,
    CommandExecutionFailed(String),
    CommandNotScripted(String),
    NotImplemented,
    Weird,
}

impl fmt::Display for SystemError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            SystemError::NotFound
                => write!(formatter, "No such file or directory"),

            SystemError::AlreadyExists(path)
                => write!(formatter, "Path already exists: {}", path),

            SystemError::FileInPlaceOfDirectory(component)
                => write!(formatter, "Expected directory, found file: {}", component),

            SystemError::DirectoryInPlaceOfFile(component)
                => write!(formatter, "Expected file, found directory: {}", component),

            SystemError::PathEmpty
                => write!(formatter, "Invalid arguments: found empty path"),

            SystemError::RemoveFileFoundDir
                => write!(formatter, "Attempt to remove file, found directory"),

            SystemError::RemoveDirFoundFile
                => write!(formatter, "Attempt to remove directory, found file"),

            SystemError::ModifiedNotFound
                => write!(formatter, "Attempt to access modified time for file failed"),

            SystemError::CommandExecutionFailed(message)
                => write!(formatter, "Underlying OS failed to execute command: {}", message),

            SystemError::CommandNotScripted(name)
                => write!(formatter, "Fake system has no script for command: {}", name),

            SystemError::NotImplemented
                => write!(formatter, "Attempt to perform an operation not implemented by this system"),

            SystemError::Weird
                => write!(formatter, "Weird error, this happens when internal logic fails in a way the programmer didn't think was possible"),
        }
    }
}

/*  The System trait is the OS boundary.  Everything the build system
    does to the outside world goes through one of these: file I/O,
    directory listing, and subprocess execution.  RealSystem forwards to
    std, FakeSystem keeps an in-memory tree so tests control the world
    completely.

    Paths are plain strings relative to the process working directory,
    with '/' separators. */
pub trait System : Clone + Send + Sync
{
    type File : io::Read + io::Write + fmt::Debug;

    fn open(&self, path : &str) -> Result<Self::File, SystemError>;
    fn create_file(&mut self, path : &str) -> Result<Self::File, SystemError>;
    fn create_dir_all(&mut self, path : &str) -> Result<(), SystemError>;
    fn is_dir(&self, path : &str) -> bool;
    fn is_file(&self, path : &str) -> bool;

    /*  Full paths of the immediate children, sorted. */
    fn list_dir(&self, path : &str) -> Result<Vec<String>, SystemError>;

    fn remove_file(&mut self, path : &str) -> Result<(), SystemError>;
    fn remove_dir(&mut self, path : &str) -> Result<(), SystemError>;
    fn rename(&mut self, from : &str, to : &str) -> Result<(), SystemError>;

    /*  Replaces whatever is at `link` with a symlink to `original`. */
    fn symlink(&mut self, original : &str, link : &str) -> Result<(), SystemError>;

    fn get_modified(&self, path : &str) -> Result<SystemTime, SystemError>;

    /*  Runs a subprocess to completion.  When timeout_ms elapses first,
        the child is killed and the output reports failure. */
    fn execute_command(
        &mut self,
        command_list : Vec<String>,
        timeout_ms : Option<u64>) -> Result<CommandLineOutput, SystemError>;
}
