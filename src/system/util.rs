use crate::system::
{
    System,
    ReadWriteError,
};
use std::io::
{
    Read,
    Write
};
use std::time::Duration;
use std::time::SystemTime;

pub fn timestamp_to_system_time(timestamp : u64) -> SystemTime
{
    SystemTime::UNIX_EPOCH
        + Duration::from_secs(timestamp / 1_000_000u64)
        + Duration::from_micros(timestamp % 1_000_000u64)
}

/*  Supplants the file at the given path with the given binary content.
    Echoes the underlying error if opening or writing fails. */
pub fn write_file
<
    SystemType : System,
>
(
    system : &mut SystemType,
    path : &str,
    content : &[u8]
)
-> Result<(), ReadWriteError>
{
    match system.create_file(path)
    {
        Ok(mut file) =>
        {
            match file.write_all(content)
            {
                Ok(()) => Ok(()),
                Err(error) => Err(ReadWriteError::IOError(error)),
            }
        },
        Err(error) => Err(ReadWriteError::SystemError(error)),
    }
}

pub fn write_str_to_file
<
    SystemType : System,
>
(
    system : &mut SystemType,
    path : &str,
    content : &str
)
-> Result<(), ReadWriteError>
{
    write_file(system, path, content.as_bytes())
}

/*  Reads the entire content of the file at the given path into a
    vector of bytes. */
pub fn read_file
<
    SystemType : System,
>
(
    system : &SystemType,
    path : &str
)
-> Result<Vec<u8>, ReadWriteError>
{
    match system.open(path)
    {
        Ok(mut file) =>
        {
            let mut content = Vec::new();
            match file.read_to_end(&mut content)
            {
                Ok(_size) => Ok(content),
                Err(error) => Err(ReadWriteError::IOError(error)),
            }
        },
        Err(error) => Err(ReadWriteError::SystemError(error)),
    }
}

pub fn read_file_to_string
<
    SystemType : System,
>
(
    system : &SystemType,
    path : &str
)
-> Result<String, ReadWriteError>
{
    let content = read_file(system, path)?;
    match String::from_utf8(content)
    {
        Ok(text) => Ok(text),
        Err(error) => Err(ReadWriteError::IOError(
            std::io::Error::new(std::io::ErrorKind::InvalidData, error))),
    }
}
