extern crate toml;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, PartialEq)]
pub enum ConfigError
{
    TomlSyntax(String),
    NotATable(String),
    UnsupportedValue(String, String),
    BadOverride(String),
    BadImplicitInclude(String, String),
}

impl fmt::Display for ConfigError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            ConfigError::TomlSyntax(message) =>
                write!(formatter, "Configuration file failed to parse: {}", message),

            ConfigError::NotATable(section) =>
                write!(formatter, "Configuration section is not a table: {}", section),

            ConfigError::UnsupportedValue(section, key) =>
                write!(formatter, "Configuration value must be a string, integer or boolean: {}.{}", section, key),

            ConfigError::BadOverride(text) =>
                write!(formatter, "Configuration override must look like section.key=value: {}", text),

            ConfigError::BadImplicitInclude(prefix, text) =>
                write!(formatter, "Implicit include for prefix {} must look like label::symbol,alias=symbol: {}", prefix, text),
        }
    }
}

/*  A configuration is sections of key-value pairs, all strings.  Values
    come out of a toml file and command-line overrides; ordering is
    canonical (BTreeMap) so anything derived from a configuration hashes
    deterministically. */
#[derive(Debug, Clone, PartialEq)]
pub struct Config
{
    sections : BTreeMap<String, BTreeMap<String, String>>,
}

impl Config
{
    pub fn empty() -> Config
    {
        Config
        {
            sections : BTreeMap::new()
        }
    }

    pub fn from_toml_str(text : &str) -> Result<Config, ConfigError>
    {
        let value : toml::Value =
        match text.parse()
        {
            Ok(value) => value,
            Err(error) => return Err(ConfigError::TomlSyntax(error.to_string())),
        };

        let table =
        match value.as_table()
        {
            Some(table) => table,
            None => return Err(ConfigError::NotATable("".to_string())),
        };

        let mut sections = BTreeMap::new();
        for (section_name, section_value) in table
        {
            let section_table =
            match section_value.as_table()
            {
                Some(section_table) => section_table,
                None => return Err(ConfigError::NotATable(section_name.clone())),
            };

            let mut pairs = BTreeMap::new();
            for (key, value) in section_table
            {
                let text =
                match value
                {
                    toml::Value::String(text) => text.clone(),
                    toml::Value::Integer(number) => format!("{}", number),
                    toml::Value::Boolean(flag) => format!("{}", flag),
                    _ => return Err(ConfigError::UnsupportedValue(section_name.clone(), key.clone())),
                };
                pairs.insert(key.clone(), text);
            }
            sections.insert(section_name.clone(), pairs);
        }

        Ok(Config{sections : sections})
    }

    /*  Applies a command-line override of the form section.key=value.
        Overrides win over file contents. */
    pub fn apply_override(&mut self, text : &str) -> Result<(), ConfigError>
    {
        let equals =
        match text.find('=')
        {
            Some(index) => index,
            None => return Err(ConfigError::BadOverride(text.to_string())),
        };

        let path = &text[..equals];
        let value = &text[equals+1..];

        let dot =
        match path.find('.')
        {
            Some(index) => index,
            None => return Err(ConfigError::BadOverride(text.to_string())),
        };

        let section = &path[..dot];
        let key = &path[dot+1..];
        if section == "" || key == ""
        {
            return Err(ConfigError::BadOverride(text.to_string()));
        }

        self.sections
            .entry(section.to_string())
            .or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn get(&self, section : &str, key : &str) -> Option<&str>
    {
        match self.sections.get(section)
        {
            Some(pairs) => pairs.get(key).map(|value| value.as_str()),
            None => None,
        }
    }

    pub fn get_or(&self, section : &str, key : &str, default : &str) -> String
    {
        match self.get(section, key)
        {
            Some(value) => value.to_string(),
            None => default.to_string(),
        }
    }

    pub fn get_bool(&self, section : &str, key : &str, default : bool) -> bool
    {
        match self.get(section, key)
        {
            Some("true") => true,
            Some("false") => false,
            _ => default,
        }
    }

    pub fn get_usize(&self, section : &str, key : &str, default : usize) -> usize
    {
        match self.get(section, key)
        {
            Some(text) =>
            {
                match text.parse()
                {
                    Ok(number) => number,
                    Err(_) => default,
                }
            },
            None => default,
        }
    }

    pub fn section(&self, section : &str) -> Option<&BTreeMap<String, String>>
    {
        self.sections.get(section)
    }

    /*  A stable one-line-per-pair rendering, fed into rule-key seeds
        and used by `audit config`. */
    pub fn render(&self) -> String
    {
        let mut out = String::new();
        for (section, pairs) in &self.sections
        {
            for (key, value) in pairs
            {
                out.push_str(&format!("{}.{} = {}\n", section, key, value));
            }
        }
        out
    }
}

/*  The active platform: a name and the set of constraint labels that
    select() conditions test against.  Conditions are labels like
    "os=linux"; a condition may require several at once by joining them
    with '+'. */
#[derive(Debug, Clone, PartialEq)]
pub struct Platform
{
    pub name : String,
    pub constraints : BTreeSet<String>,
}

impl Platform
{
    pub fn from_config(config : &Config) -> Platform
    {
        let mut constraints = BTreeSet::new();
        match config.get("platform", "constraints")
        {
            Some(text) =>
            {
                for label in text.split(',')
                {
                    let label = label.trim();
                    if label != ""
                    {
                        constraints.insert(label.to_string());
                    }
                }
            },
            None => {},
        }

        Platform
        {
            name : config.get_or("platform", "name", "default"),
            constraints : constraints,
        }
    }

    pub fn satisfies(&self, condition : &str) -> bool
    {
        condition.split('+').all(|part| self.constraints.contains(part.trim()))
    }
}

/*  One implicit per-package include: an extension label plus the
    symbols to inject, each under an alias. */
#[derive(Debug, Clone, PartialEq)]
pub struct ImplicitInclude
{
    pub label : String,
    pub symbols : Vec<(String, String)>,
}

/*  The configuration-driven map from package-path prefix to implicit
    include.  The deepest matching prefix wins. */
#[derive(Debug, Clone)]
pub struct ImplicitIncludeMap
{
    by_prefix : BTreeMap<String, ImplicitInclude>,
}

impl ImplicitIncludeMap
{
    pub fn empty() -> ImplicitIncludeMap
    {
        ImplicitIncludeMap{ by_prefix : BTreeMap::new() }
    }

    /*  Reads the [implicit_includes] section.  Each value is
        "label::symbolspec,symbolspec" where symbolspec is either
        "symbol" or "alias=symbol". */
    pub fn from_config(config : &Config) -> Result<ImplicitIncludeMap, ConfigError>
    {
        let mut by_prefix = BTreeMap::new();

        let section =
        match config.section("implicit_includes")
        {
            Some(section) => section,
            None => return Ok(ImplicitIncludeMap{by_prefix : by_prefix}),
        };

        for (prefix, text) in section
        {
            let separator =
            match text.find("::")
            {
                Some(index) => index,
                None => return Err(ConfigError::BadImplicitInclude(prefix.clone(), text.clone())),
            };

            let label = text[..separator].to_string();
            let mut symbols = vec![];
            for spec in text[separator+2..].split(',')
            {
                let spec = spec.trim();
                if spec == ""
                {
                    return Err(ConfigError::BadImplicitInclude(prefix.clone(), text.clone()));
                }
                match spec.find('=')
                {
                    Some(index) =>
                        symbols.push((spec[..index].to_string(), spec[index+1..].to_string())),
                    None =>
                        symbols.push((spec.to_string(), spec.to_string())),
                }
            }

            by_prefix.insert(
                prefix.clone(),
                ImplicitInclude{label : label, symbols : symbols});
        }

        Ok(ImplicitIncludeMap{by_prefix : by_prefix})
    }

    /*  The include whose prefix is the deepest one containing the given
        package path.  The empty prefix contains everything. */
    pub fn lookup(&self, package : &str) -> Option<&ImplicitInclude>
    {
        let mut best : Option<(&String, &ImplicitInclude)> = None;
        for (prefix, include) in &self.by_prefix
        {
            let matches =
                prefix == ""
                || package == prefix
                || package.starts_with(&format!("{}/", prefix));

            if matches
            {
                match best
                {
                    Some((best_prefix, _)) =>
                    {
                        if prefix.len() > best_prefix.len()
                        {
                            best = Some((prefix, include));
                        }
                    },
                    None => best = Some((prefix, include)),
                }
            }
        }
        best.map(|(_prefix, include)| include)
    }
}

#[cfg(test)]
mod test
{
    use crate::config::
    {
        Config,
        ConfigError,
        ImplicitIncludeMap,
        Platform,
    };

    #[test]
    fn parse_sections_and_values()
    {
        let config = Config::from_toml_str("\
[project]
build_file = \"BUILD\"

[build]
jobs = 4
cache = true
").unwrap();

        assert_eq!(config.get("project", "build_file"), Some("BUILD"));
        assert_eq!(config.get("build", "jobs"), Some("4"));
        assert_eq!(config.get_usize("build", "jobs", 1), 4);
        assert_eq!(config.get_bool("build", "cache", false), true);
        assert_eq!(config.get("build", "nope"), None);
    }

    #[test]
    fn parse_bad_toml_is_an_error()
    {
        match Config::from_toml_str("[project\nbad")
        {
            Err(ConfigError::TomlSyntax(_)) => {},
            other => panic!("Wrong result: {:?}", other),
        }
    }

    #[test]
    fn overrides_win()
    {
        let mut config = Config::from_toml_str("[build]\njobs = 4\n").unwrap();
        config.apply_override("build.jobs=8").unwrap();
        config.apply_override("platform.name=ci").unwrap();
        assert_eq!(config.get("build", "jobs"), Some("8"));
        assert_eq!(config.get("platform", "name"), Some("ci"));
    }

    #[test]
    fn bad_override_is_an_error()
    {
        let mut config = Config::empty();
        assert_eq!(
            config.apply_override("no-equals-sign"),
            Err(ConfigError::BadOverride("no-equals-sign".to_string())));
        assert_eq!(
            config.apply_override("nodot=value"),
            Err(ConfigError::BadOverride("nodot=value".to_string())));
    }

    #[test]
    fn render_is_stable()
    {
        let mut config = Config::empty();
        config.apply_override("b.two=2").unwrap();
        config.apply_override("a.one=1").unwrap();
        assert_eq!(config.render(), "a.one = 1\nb.two = 2\n");
    }

    #[test]
    fn platform_satisfies_constraints()
    {
        let mut config = Config::empty();
        config.apply_override("platform.name=linux-x86").unwrap();
        config.apply_override("platform.constraints=os=linux,arch=x86_64").unwrap();

        let platform = Platform::from_config(&config);
        assert_eq!(platform.name, "linux-x86");
        assert!(platform.satisfies("os=linux"));
        assert!(platform.satisfies("os=linux+arch=x86_64"));
        assert!(!platform.satisfies("os=macos"));
        assert!(!platform.satisfies("os=linux+arch=arm64"));
    }

    #[test]
    fn implicit_includes_deepest_prefix_wins()
    {
        let config = Config::from_toml_str("\
[implicit_includes]
\"\" = \"//tools:common.lua::helper\"
\"java\" = \"//tools:java.lua::library=java_library,binary=java_binary\"
\"java/generated\" = \"//tools:generated.lua::emit\"
").unwrap();

        let map = ImplicitIncludeMap::from_config(&config).unwrap();

        assert_eq!(map.lookup("cxx").unwrap().label, "//tools:common.lua");
        assert_eq!(map.lookup("java").unwrap().label, "//tools:java.lua");
        assert_eq!(map.lookup("java/app").unwrap().label, "//tools:java.lua");
        assert_eq!(map.lookup("java/generated/deep").unwrap().label, "//tools:generated.lua");
        assert_eq!(
            map.lookup("java").unwrap().symbols,
            vec![
                ("library".to_string(), "java_library".to_string()),
                ("binary".to_string(), "java_binary".to_string())]);
    }

    #[test]
    fn implicit_includes_no_match()
    {
        let config = Config::from_toml_str("\
[implicit_includes]
\"java\" = \"//tools:java.lua::library=java_library\"
").unwrap();

        let map = ImplicitIncludeMap::from_config(&config).unwrap();
        assert!(map.lookup("cxx").is_none());
        assert!(map.lookup("javascript").is_none());
    }

    #[test]
    fn implicit_includes_bad_spec_is_an_error()
    {
        let config = Config::from_toml_str("\
[implicit_includes]
\"java\" = \"//tools:java.lua\"
").unwrap();

        match ImplicitIncludeMap::from_config(&config)
        {
            Err(ConfigError::BadImplicitInclude(prefix, _)) => assert_eq!(prefix, "java"),
            other => panic!("Wrong result: {:?}", other),
        }
    }
}
