extern crate serde;

use serde::{Serialize, Deserialize};
use std::fmt;

/*  The canonical identity of a target.  The cell name is always
    resolved (parsing fills in the context cell when the label doesn't
    carry one), the base path has no leading or trailing slash, and
    flavors are kept sorted so equality and ordering work over the
    normalized tuple.  Immutable after construction. */
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BuildTarget
{
    pub cell : String,
    pub base_path : String,
    pub short_name : String,
    pub flavors : Vec<String>,
    pub configuration : Option<String>,
}

#[derive(Debug, PartialEq)]
pub enum TargetParseError
{
    Empty,
    MissingSlashes(String),
    EmptyShortName(String),
    EmptyFlavor(String),
    RelativeWithoutContext(String),
}

impl fmt::Display for TargetParseError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            TargetParseError::Empty =>
                write!(formatter, "Empty target label"),

            TargetParseError::MissingSlashes(label) =>
                write!(formatter, "Target label missing //: {}", label),

            TargetParseError::EmptyShortName(label) =>
                write!(formatter, "Target label has empty name after the colon: {}", label),

            TargetParseError::EmptyFlavor(label) =>
                write!(formatter, "Target label has an empty flavor: {}", label),

            TargetParseError::RelativeWithoutContext(label) =>
                write!(formatter, "Relative target label used where no package is in scope: {}", label),
        }
    }
}

fn normalize_path(path : &str) -> String
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

/*  Splits "name#flavor,flavor" and returns (name, sorted flavors). */
fn split_flavors(text : &str, label : &str) -> Result<(String, Vec<String>), TargetParseError>
{
    match text.find('#')
    {
        None => Ok((text.to_string(), vec![])),
        Some(index) =>
        {
            let name = text[..index].to_string();
            let mut flavors = vec![];
            for flavor in text[index+1..].split(',')
            {
                if flavor == ""
                {
                    return Err(TargetParseError::EmptyFlavor(label.to_string()));
                }
                flavors.push(flavor.to_string());
            }
            flavors.sort();
            flavors.dedup();
            Ok((name, flavors))
        }
    }
}

impl BuildTarget
{
    pub fn new(cell : &str, base_path : &str, short_name : &str) -> BuildTarget
    {
        BuildTarget
        {
            cell : cell.to_string(),
            base_path : normalize_path(base_path),
            short_name : short_name.to_string(),
            flavors : vec![],
            configuration : None,
        }
    }

    pub fn with_flavors(mut self, mut flavors : Vec<String>) -> BuildTarget
    {
        flavors.sort();
        flavors.dedup();
        self.flavors = flavors;
        self
    }

    /*  Parses a label of the form:

            [@][cell]//base/path:short_name[#flavor,flavor]
            [@][cell]//base/path            (short name = last component)
            :short_name                     (same package as the context)

        context_cell fills in a missing cell name; context_package is
        the package a bare ":name" label refers to. */
    pub fn parse(
        label : &str,
        context_cell : &str,
        context_package : Option<&str>) -> Result<BuildTarget, TargetParseError>
    {
        if label == ""
        {
            return Err(TargetParseError::Empty);
        }

        if label.starts_with(':')
        {
            let package =
            match context_package
            {
                Some(package) => package,
                None => return Err(TargetParseError::RelativeWithoutContext(label.to_string())),
            };

            let (short_name, flavors) = split_flavors(&label[1..], label)?;
            if short_name == ""
            {
                return Err(TargetParseError::EmptyShortName(label.to_string()));
            }
            return Ok(BuildTarget::new(context_cell, package, &short_name).with_flavors(flavors));
        }

        let trimmed =
        match label.strip_prefix('@')
        {
            Some(rest) => rest,
            None => label,
        };

        let (cell, rest) =
        match trimmed.find("//")
        {
            Some(index) =>
            {
                let cell_text = &trimmed[..index];
                (
                    if cell_text == "" { context_cell.to_string() } else { cell_text.to_string() },
                    &trimmed[index+2..]
                )
            },
            None => return Err(TargetParseError::MissingSlashes(label.to_string())),
        };

        match rest.find(':')
        {
            Some(index) =>
            {
                let base_path = &rest[..index];
                let (short_name, flavors) = split_flavors(&rest[index+1..], label)?;
                if short_name == ""
                {
                    return Err(TargetParseError::EmptyShortName(label.to_string()));
                }
                Ok(BuildTarget::new(&cell, base_path, &short_name).with_flavors(flavors))
            },
            None =>
            {
                /*  "//foo/bar" is shorthand for "//foo/bar:bar". */
                let base_path = normalize_path(rest);
                let short_name =
                match base_path.rsplit('/').next()
                {
                    Some(last) if last != "" => last.to_string(),
                    _ => return Err(TargetParseError::EmptyShortName(label.to_string())),
                };
                Ok(BuildTarget::new(&cell, &base_path, &short_name))
            }
        }
    }
}

impl fmt::Display for BuildTarget
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        write!(formatter, "{}//{}:{}", self.cell, self.base_path, self.short_name)?;
        if self.flavors.len() > 0
        {
            write!(formatter, "#{}", self.flavors.join(","))?;
        }
        Ok(())
    }
}

/*  A target pattern as typed on the command line: one target, every
    target in one package, or every target under a subtree. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetPattern
{
    Single(BuildTarget),
    Package
    {
        cell : String,
        base_path : String,
    },
    Recursive
    {
        cell : String,
        base_path : String,
    },
}

impl TargetPattern
{
    pub fn parse(text : &str, context_cell : &str) -> Result<TargetPattern, TargetParseError>
    {
        if text == ""
        {
            return Err(TargetParseError::Empty);
        }

        if text.ends_with("/...") || text == "..." || text.ends_with("//...")
        {
            let without_dots = &text[..text.len()-3];
            let trimmed =
            match without_dots.strip_prefix('@')
            {
                Some(rest) => rest,
                None => without_dots,
            };
            match trimmed.find("//")
            {
                Some(index) =>
                {
                    let cell_text = &trimmed[..index];
                    return Ok(TargetPattern::Recursive
                    {
                        cell : if cell_text == "" { context_cell.to_string() } else { cell_text.to_string() },
                        base_path : normalize_path(&trimmed[index+2..]),
                    });
                },
                None => return Err(TargetParseError::MissingSlashes(text.to_string())),
            }
        }

        if text.ends_with(':')
        {
            let without_colon = &text[..text.len()-1];
            let trimmed =
            match without_colon.strip_prefix('@')
            {
                Some(rest) => rest,
                None => without_colon,
            };
            match trimmed.find("//")
            {
                Some(index) =>
                {
                    let cell_text = &trimmed[..index];
                    return Ok(TargetPattern::Package
                    {
                        cell : if cell_text == "" { context_cell.to_string() } else { cell_text.to_string() },
                        base_path : normalize_path(&trimmed[index+2..]),
                    });
                },
                None => return Err(TargetParseError::MissingSlashes(text.to_string())),
            }
        }

        Ok(TargetPattern::Single(BuildTarget::parse(text, context_cell, None)?))
    }

    pub fn cell(&self) -> &str
    {
        match self
        {
            TargetPattern::Single(target) => &target.cell,
            TargetPattern::Package{cell, ..} => cell,
            TargetPattern::Recursive{cell, ..} => cell,
        }
    }
}

impl fmt::Display for TargetPattern
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            TargetPattern::Single(target) =>
                write!(formatter, "{}", target),

            TargetPattern::Package{cell, base_path} =>
                write!(formatter, "{}//{}:", cell, base_path),

            TargetPattern::Recursive{cell, base_path} =>
                write!(formatter, "{}//{}/...", cell, base_path),
        }
    }
}
