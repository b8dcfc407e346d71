extern crate bincode;
extern crate serde;

use crypto::
{
    sha2::Sha256,
    digest::Digest,
};
use std::hash::
{
    Hash,
    Hasher
};
use serde::{Serialize, Deserialize};
use crate::system::
{
    System,
    ReadWriteError,
    SystemError,
};
use std::fmt;
use std::io::Read;

use num_bigint::
{
    BigUint
};

use num_traits::
{
    ToPrimitive,
    identities::{Zero, One}
};

/*  A Fingerprint is 160 bits.  Base-62 needs 27 characters to cover
    that range, and 27 characters can encode slightly more than 160
    bits, hence the Overflow case below. */
pub const FINGERPRINT_BYTES : usize = 20;
pub const HUMAN_READABLE_LENGTH : usize = 27;

#[derive(Debug, PartialEq)]
pub enum FromHumanReadableError
{
    InvalidLength,
    Overflow,
    InvalidCharacter(char),
}

impl fmt::Display for FromHumanReadableError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            FromHumanReadableError::InvalidLength =>
                write!(formatter, "Invalid length, must be {}", HUMAN_READABLE_LENGTH),

            FromHumanReadableError::Overflow =>
                write!(formatter, "Encodes a value too big to fit in a 160-bit unsigned integer"),

            FromHumanReadableError::InvalidCharacter(character) =>
                write!(formatter, "Invalid character: {} must be 0-9 a-z A-Z", character),
        }
    }
}

fn decode62(text : &str) -> Result<[u8; FINGERPRINT_BYTES], FromHumanReadableError>
{
    if text.len() != HUMAN_READABLE_LENGTH
    {
        return Err(FromHumanReadableError::InvalidLength);
    }

    let mut n = BigUint::zero();
    let mut d = BigUint::one();
    for c in text.chars()
    {
        n += &d *
        match c
        {
            '0'..='9' => (c as u32) - ('0' as u32),
            'a'..='z' => (c as u32) - ('a' as u32) + 10,
            'A'..='Z' => (c as u32) - ('A' as u32) + 36,
            _ =>
            {
                return Err(FromHumanReadableError::InvalidCharacter(c));
            },
        };
        d *= 62u32;
    }

    let v = n.to_bytes_le();
    if v.len() > FINGERPRINT_BYTES
    {
        return Err(FromHumanReadableError::Overflow);
    }

    let mut result = [0u8; FINGERPRINT_BYTES];
    for (i, x) in v.into_iter().enumerate()
    {
        result[i] = x;
    }

    Ok(result)
}

fn encode62(bytes : &[u8; FINGERPRINT_BYTES]) -> String
{
    let mut n = BigUint::from_bytes_le(bytes);

    // 0-9, a-z, A-Z
    let alphabet : [u8; 62] = [
        48, 49, 50, 51, 52, 53, 54, 55, 56, 57,
        97, 98, 99, 100, 101, 102, 103, 104, 105, 106, 107, 108, 109, 110, 111, 112, 113, 114, 115, 116, 117, 118, 119, 120, 121, 122,
        65, 66, 67, 68, 69, 70, 71, 72, 73, 74, 75, 76, 77, 78, 79, 80, 81, 82, 83, 84, 85, 86, 87, 88, 89, 90
    ];

    let mut buffer = [48u8; HUMAN_READABLE_LENGTH];
    let mut i = 0;
    while n > BigUint::zero()
    {
        buffer[i] = alphabet[
            (&n % 62u32).to_u32().unwrap() as usize];
        i+=1;
        n /= 62u32;
    }

    std::str::from_utf8(&buffer).unwrap().to_string()
}

/*  FingerprintFactory wraps a SHA-256 digest.  Feed it data bit by bit
    using the functions that start with "input_", then obtain the
    Fingerprint by calling result().  The digest truncates to 20 bytes. */
pub struct FingerprintFactory
{
    dig : Sha256
}

impl FingerprintFactory
{
    pub fn new() -> FingerprintFactory
    {
        FingerprintFactory{ dig : Sha256::new() }
    }

    /*  Construct a FingerprintFactory immediately reading in
        the bytes of the given string as input. */
    pub fn from_str(first_input : &str) -> FingerprintFactory
    {
        let mut d = Sha256::new();
        d.input(first_input.as_bytes());
        FingerprintFactory{ dig : d }
    }

    /*  Incorporate the bytes of another Fingerprint into the currently
        building one. */
    pub fn input_fingerprint(&mut self, input : &Fingerprint)
    {
        self.dig.input(&input.digest);
    }

    pub fn input_str(&mut self, input : &str)
    {
        self.dig.input(input.as_bytes());
    }

    pub fn input_bytes(&mut self, input : &[u8])
    {
        self.dig.input(input);
    }

    /*  Create a Fingerprint from the bytes incorporated so far. */
    pub fn result(&mut self) -> Fingerprint
    {
        let mut out_sha = [0u8; 32];
        self.dig.result(&mut out_sha);
        let mut digest = [0u8; FINGERPRINT_BYTES];
        digest.copy_from_slice(&out_sha[..FINGERPRINT_BYTES]);
        Fingerprint
        {
            digest : digest
        }
    }

    /*  Construct a FingerprintFactory initialized with the contents of
        a file obtained through a System. */
    pub fn from_file<SystemType : System>
    (
        system : &SystemType,
        path : &str
    )
    ->
    Result<FingerprintFactory, ReadWriteError>
    {
        match system.open(path)
        {
            Ok(mut reader) =>
            {
                let mut buffer = [0u8; 256];
                let mut dig = Sha256::new();
                loop
                {
                    match reader.read(&mut buffer)
                    {
                        Ok(0) =>
                        {
                            return Ok(FingerprintFactory{dig : dig});
                        }
                        Ok(size) =>
                        {
                            dig.input(&buffer[..size]);
                        },
                        Err(error) => return Err(ReadWriteError::IOError(error)),
                    }
                }
            },
            Err(error) => return Err(ReadWriteError::SystemError(error)),
        }
    }

    /*  Construct a FingerprintFactory initialized with the recursive
        contents of a directory: the sorted listing first, then the
        fingerprint of each entry. */
    pub fn from_directory<SystemType : System>
    (
        system : &SystemType,
        path : &str
    )
    ->
    Result<FingerprintFactory, ReadWriteError>
    {
        let path_list =
        match system.list_dir(path)
        {
            Ok(path_list) => path_list,
            Err(_error) => return Err(ReadWriteError::SystemError(SystemError::NotFound)),
        };

        let mut factory = FingerprintFactory::from_str(&path_list.join("\n"));
        for path in path_list
        {
            if system.is_dir(&path)
            {
                let mut sub_factory = FingerprintFactory::from_directory(system, &path)?;
                factory.input_fingerprint(&sub_factory.result());
            }
            else if system.is_file(&path)
            {
                let mut sub_factory = FingerprintFactory::from_file(system, &path)?;
                factory.input_fingerprint(&sub_factory.result());
            }
            else
            {
                return Err(ReadWriteError::SystemError(SystemError::NotFound));
            }
        }

        Ok(factory)
    }

    /*  File or directory, whichever the path turns out to be. */
    pub fn from_path<SystemType : System>
    (
        system : &SystemType,
        path : &str
    )
    ->
    Result<FingerprintFactory, ReadWriteError>
    {
        if system.is_dir(path)
        {
            FingerprintFactory::from_directory(system, path)
        }
        else
        {
            FingerprintFactory::from_file(system, path)
        }
    }
}

/*  A 160-bit content digest.  Fingerprints identify rule keys, file
    contents and artifact blobs. */
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone, Copy, Eq, PartialOrd, Ord)]
pub struct Fingerprint
{
    digest : [u8; FINGERPRINT_BYTES],
}

impl Hash for Fingerprint
{
    fn hash<H : Hasher>(&self, state : &mut H)
    {
        /*  The digest is already hashed data, the first 8 bytes are as
            good as all 20 for bucketing. */
        self.digest[..8].hash(state);
    }
}

impl Fingerprint
{
    /*  Returns a URL-safe human-readable digest string */
    pub fn human_readable(&self) -> String
    {
        encode62(&self.digest)
    }

    pub fn from_human_readable(text : &str) ->
        Result<Fingerprint, FromHumanReadableError>
    {
        Ok(Fingerprint{digest : decode62(text)?})
    }
}

impl fmt::Display for Fingerprint
{
    fn fmt(&self, f : &mut fmt::Formatter) -> fmt::Result
    {
        write!(f, "{}", self.human_readable())
    }
}

#[cfg(test)]
use std::collections::HashMap;

/*  Takes a string, computes a map of character to character-count */
#[cfg(test)]
fn get_counts(hash_str : &str) -> HashMap<char, i32>
{
    let mut result = HashMap::new();
    for c in hash_str.chars()
    {
        result.insert(
            c, match result.get(&c)
            {
                Some(count) => count + 1,
                None => 1
            }
        );
    }
    result
}

/*  Returns true if the given string is:
        - sufficiently long,
        - comprised of ascii characters you can type
        - random-ish. */
#[cfg(test)]
pub fn digest_heuristic(hash_str : &str) -> bool
{
    if hash_str.len() < 20
    {
        return false;
    }

    for c in hash_str.chars()
    {
        if !(c as i32 >= 0x20 && c as i32 <= 0x7e)
        {
            return false;
        }
    }

    let counts = get_counts(hash_str);
    let x = hash_str.len() as i32;
    let y = counts.len() as i32;

    return (x-y).abs() < x;
}
