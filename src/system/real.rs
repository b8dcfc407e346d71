use crate::system::
{
    System,
    SystemError,
    CommandLineOutput
};
use std::collections::VecDeque;
use std::process::
{
    Command,
    Stdio
};
use std::fs;
use std::io::ErrorKind;
use std::io::Read;
use std::path::Path;
use std::time::
{
    Duration,
    Instant,
    SystemTime
};
use std::thread;

#[derive(Debug, Clone)]
pub struct RealSystem
{
}

impl RealSystem
{
    pub fn new() -> Self
    {
        RealSystem{}
    }
}

fn convert_io_error_to_system_error(error : std::io::Error) -> SystemError
{
    match error.kind()
    {
        ErrorKind::NotFound
            => SystemError::NotFound,

        ErrorKind::AlreadyExists
            => SystemError::AlreadyExists("".to_string()),

        _ => SystemError::Weird,
    }
}

impl System for RealSystem
{
    type File = fs::File;

    fn open(&self, path : &str) -> Result<Self::File, SystemError>
    {
        match fs::File::open(path)
        {
            Ok(file) => Ok(file),
            Err(error) => Err(convert_io_error_to_system_error(error)),
        }
    }

    fn create_file(&mut self, path : &str) -> Result<Self::File, SystemError>
    {
        match fs::File::create(path)
        {
            Ok(file) => Ok(file),
            Err(error) => Err(convert_io_error_to_system_error(error)),
        }
    }

    fn create_dir_all(&mut self, path : &str) -> Result<(), SystemError>
    {
        match fs::create_dir_all(path)
        {
            Ok(()) => Ok(()),
            Err(error) => Err(convert_io_error_to_system_error(error)),
        }
    }

    fn is_dir(&self, path : &str) -> bool
    {
        Path::new(path).is_dir()
    }

    fn is_file(&self, path : &str) -> bool
    {
        Path::new(path).is_file()
    }

    fn list_dir(&self, path : &str) -> Result<Vec<String>, SystemError>
    {
        let entries =
        match fs::read_dir(path)
        {
            Ok(entries) => entries,
            Err(error) => return Err(convert_io_error_to_system_error(error)),
        };

        let mut result = Vec::new();
        for entry in entries
        {
            match entry
            {
                Ok(entry) =>
                {
                    match entry.file_name().into_string()
                    {
                        Ok(name) => result.push(format!("{}/{}", path, name)),
                        Err(_) => return Err(SystemError::Weird),
                    }
                },
                Err(error) => return Err(convert_io_error_to_system_error(error)),
            }
        }

        result.sort();
        Ok(result)
    }

    fn remove_file(&mut self, path : &str) -> Result<(), SystemError>
    {
        if Path::new(path).is_dir()
        {
            return Err(SystemError::RemoveFileFoundDir);
        }

        match fs::remove_file(path)
        {
            Ok(()) => Ok(()),
            Err(error) => Err(convert_io_error_to_system_error(error)),
        }
    }

    fn remove_dir(&mut self, path : &str) -> Result<(), SystemError>
    {
        if Path::new(path).is_file()
        {
            return Err(SystemError::RemoveDirFoundFile);
        }

        match fs::remove_dir_all(path)
        {
            Ok(()) => Ok(()),
            Err(error) => Err(convert_io_error_to_system_error(error)),
        }
    }

    fn rename(&mut self, from : &str, to : &str) -> Result<(), SystemError>
    {
        match fs::rename(from, to)
        {
            Ok(()) => Ok(()),
            Err(error) => Err(convert_io_error_to_system_error(error)),
        }
    }

    #[cfg(unix)]
    fn symlink(&mut self, original : &str, link : &str) -> Result<(), SystemError>
    {
        match fs::remove_file(link)
        {
            Ok(()) => {},
            Err(_error) => {},
        }

        match std::os::unix::fs::symlink(original, link)
        {
            Ok(()) => Ok(()),
            Err(error) => Err(convert_io_error_to_system_error(error)),
        }
    }

    #[cfg(not(unix))]
    fn symlink(&mut self, _original : &str, _link : &str) -> Result<(), SystemError>
    {
        Err(SystemError::NotImplemented)
    }

    fn get_modified(&self, path : &str) -> Result<SystemTime, SystemError>
    {
        match fs::metadata(path)
        {
            Ok(metadata) =>
            {
                match metadata.modified()
                {
                    Ok(time) => Ok(time),
                    Err(_error) => Err(SystemError::ModifiedNotFound),
                }
            },
            Err(_error) => Err(SystemError::ModifiedNotFound),
        }
    }

    fn execute_command(
        &mut self,
        command_list : Vec<String>,
        timeout_ms : Option<u64>) -> Result<CommandLineOutput, SystemError>
    {
        let mut command_queue = VecDeque::from(command_list);
        let mut command =
        match command_queue.pop_front()
        {
            Some(first) =>
            {
                let mut command = Command::new(first);
                while let Some(argument) = command_queue.pop_front()
                {
                    command.arg(argument);
                }
                command
            },
            None => return Ok(CommandLineOutput::new()),
        };

        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child =
        match command.spawn()
        {
            Ok(child) => child,
            Err(error) => return Err(SystemError::CommandExecutionFailed(error.to_string())),
        };

        let deadline = timeout_ms.map(
            |millis|
            {
                Instant::now() + Duration::from_millis(millis)
            });

        loop
        {
            match child.try_wait()
            {
                Ok(Some(_status)) =>
                {
                    return match child.wait_with_output()
                    {
                        Ok(output) => Ok(CommandLineOutput::from_output(output)),
                        Err(error) => Err(SystemError::CommandExecutionFailed(error.to_string())),
                    };
                },
                Ok(None) => {},
                Err(error) => return Err(SystemError::CommandExecutionFailed(error.to_string())),
            }

            match deadline
            {
                Some(deadline) =>
                {
                    if Instant::now() >= deadline
                    {
                        match child.kill()
                        {
                            Ok(()) => {},
                            Err(_error) => {},
                        }

                        let mut err = String::new();
                        match child.stderr.take()
                        {
                            Some(mut stderr) =>
                            {
                                match stderr.read_to_string(&mut err)
                                {
                                    Ok(_size) => {},
                                    Err(_error) => {},
                                }
                            },
                            None => {},
                        }

                        match child.wait()
                        {
                            Ok(_status) => {},
                            Err(_error) => {},
                        }

                        return Ok(CommandLineOutput
                        {
                            out : "".to_string(),
                            err : format!("command timed out\n{}", err),
                            code : None,
                            success : false,
                        });
                    }
                },
                None => {},
            }

            thread::sleep(Duration::from_millis(10));
        }
    }
}
