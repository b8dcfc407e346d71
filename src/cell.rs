use crate::config::
{
    Config,
    ConfigError,
};
use crate::system::System;
use crate::system::util::read_file_to_string;
use std::collections::BTreeMap;
use std::fmt;

pub static CONFIG_FILE_NAME : &str = "quarry.toml";
pub static DEFAULT_BUILD_FILE_NAME : &str = "BUILD";
pub static DEFAULT_ROOT_CELL_NAME : &str = "root";

#[derive(Debug)]
pub enum CellError
{
    ConfigFailedToRead(String),
    ConfigFailedToParse(String, ConfigError),
    UnknownCell(String),
}

impl fmt::Display for CellError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            CellError::ConfigFailedToRead(path) =>
                write!(formatter, "Configuration file failed to read: {}", path),

            CellError::ConfigFailedToParse(path, error) =>
                write!(formatter, "{}: {}", path, error),

            CellError::UnknownCell(name) =>
                write!(formatter, "Reference to unknown cell: {}", name),
        }
    }
}

fn join_path(parts : &[&str]) -> String
{
    let mut nonempty = vec![];
    for part in parts
    {
        if *part != ""
        {
            nonempty.push(*part);
        }
    }
    nonempty.join("/")
}

fn normalize_root(path : &str) -> String
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

/*  A named root of the source tree.  Each cell carries its own
    configuration and its own build-file name. */
#[derive(Debug, Clone)]
pub struct Cell
{
    pub name : String,
    pub root : String,
    pub build_file_name : String,
    pub config : Config,
}

impl Cell
{
    /*  The path of the build file declaring targets in the given
        package. */
    pub fn build_file_path(&self, package : &str) -> String
    {
        join_path(&[&self.root, package, &self.build_file_name])
    }

    pub fn package_dir(&self, package : &str) -> String
    {
        join_path(&[&self.root, package])
    }

    /*  The on-disk path of a source file given cell-relative path. */
    pub fn source_path(&self, cell_relative : &str) -> String
    {
        join_path(&[&self.root, cell_relative])
    }
}

/*  The static map of cells.  Built once per command from the root
    cell's configuration file; the [cells] section maps additional cell
    names to their roots. */
#[derive(Debug, Clone)]
pub struct CellResolver
{
    cells : BTreeMap<String, Cell>,
    root_cell_name : String,
}

impl CellResolver
{
    /*  Reads the project configuration and assembles the cell map.
        Overrides are command-line --config flags, applied to every
        cell's configuration after file contents. */
    pub fn load<SystemType : System>
    (
        system : &SystemType,
        overrides : &Vec<String>
    )
    -> Result<CellResolver, CellError>
    {
        let root_config = CellResolver::read_config_file(system, CONFIG_FILE_NAME, overrides)?;

        let root_cell_name = root_config.get_or("project", "cell_name", DEFAULT_ROOT_CELL_NAME);

        let mut cells = BTreeMap::new();

        match root_config.section("cells")
        {
            Some(section) =>
            {
                for (name, path) in section.clone()
                {
                    let root = normalize_root(&path);
                    let config_path = join_path(&[&root, CONFIG_FILE_NAME]);
                    let config = CellResolver::read_config_file(system, &config_path, overrides)?;
                    cells.insert(
                        name.clone(),
                        Cell
                        {
                            name : name.clone(),
                            build_file_name : config.get_or(
                                "project", "build_file", DEFAULT_BUILD_FILE_NAME),
                            root : root,
                            config : config,
                        });
                }
            },
            None => {},
        }

        cells.insert(
            root_cell_name.clone(),
            Cell
            {
                name : root_cell_name.clone(),
                root : "".to_string(),
                build_file_name : root_config.get_or(
                    "project", "build_file", DEFAULT_BUILD_FILE_NAME),
                config : root_config,
            });

        Ok(CellResolver
        {
            cells : cells,
            root_cell_name : root_cell_name,
        })
    }

    fn read_config_file<SystemType : System>
    (
        system : &SystemType,
        path : &str,
        overrides : &Vec<String>
    )
    -> Result<Config, CellError>
    {
        let mut config =
        if system.is_file(path)
        {
            match read_file_to_string(system, path)
            {
                Ok(text) =>
                {
                    match Config::from_toml_str(&text)
                    {
                        Ok(config) => config,
                        Err(error) => return Err(CellError::ConfigFailedToParse(path.to_string(), error)),
                    }
                },
                Err(_error) => return Err(CellError::ConfigFailedToRead(path.to_string())),
            }
        }
        else
        {
            Config::empty()
        };

        for override_text in overrides
        {
            match config.apply_override(override_text)
            {
                Ok(()) => {},
                Err(error) => return Err(CellError::ConfigFailedToParse(path.to_string(), error)),
            }
        }

        Ok(config)
    }

    pub fn get(&self, name : &str) -> Result<&Cell, CellError>
    {
        match self.cells.get(name)
        {
            Some(cell) => Ok(cell),
            None => Err(CellError::UnknownCell(name.to_string())),
        }
    }

    pub fn root_cell(&self) -> &Cell
    {
        /*  The root cell is inserted unconditionally in load(). */
        self.cells.get(&self.root_cell_name).unwrap()
    }

    pub fn root_cell_name(&self) -> &str
    {
        &self.root_cell_name
    }

    pub fn cell_names(&self) -> Vec<String>
    {
        self.cells.keys().cloned().collect()
    }
}

#[cfg(test)]
mod test
{
    use crate::cell::CellResolver;
    use crate::system::fake::FakeSystem;
    use crate::system::util::write_str_to_file;

    #[test]
    fn load_without_config_file_gives_default_root_cell()
    {
        let system = FakeSystem::new(10);
        let resolver = CellResolver::load(&system, &vec![]).unwrap();
        let root = resolver.root_cell();
        assert_eq!(root.name, "root");
        assert_eq!(root.root, "");
        assert_eq!(root.build_file_name, "BUILD");
        assert_eq!(root.build_file_path("pkg/sub"), "pkg/sub/BUILD");
        assert_eq!(root.build_file_path(""), "BUILD");
    }

    #[test]
    fn load_with_cells_section()
    {
        let mut system = FakeSystem::new(10);
        write_str_to_file(&mut system, "quarry.toml", "\
[cells]
lib = \"libraries\"

[project]
build_file = \"TARGETS\"
").unwrap();
        write_str_to_file(&mut system, "libraries/quarry.toml", "\
[project]
build_file = \"BUILD\"
").unwrap();

        let resolver = CellResolver::load(&system, &vec![]).unwrap();
        assert_eq!(resolver.root_cell().build_file_name, "TARGETS");

        let lib = resolver.get("lib").unwrap();
        assert_eq!(lib.root, "libraries");
        assert_eq!(lib.build_file_name, "BUILD");
        assert_eq!(lib.build_file_path("pkg"), "libraries/pkg/BUILD");
        assert_eq!(lib.source_path("pkg/a.c"), "libraries/pkg/a.c");
    }

    #[test]
    fn unknown_cell_is_an_error()
    {
        let system = FakeSystem::new(10);
        let resolver = CellResolver::load(&system, &vec![]).unwrap();
        assert!(resolver.get("nonexistent").is_err());
    }

    #[test]
    fn overrides_apply_to_every_cell()
    {
        let mut system = FakeSystem::new(10);
        write_str_to_file(&mut system, "quarry.toml", "\
[cells]
lib = \"libraries\"
").unwrap();

        let resolver = CellResolver::load(
            &system,
            &vec!["platform.name=ci".to_string()]).unwrap();

        assert_eq!(resolver.root_cell().config.get("platform", "name"), Some("ci"));
        assert_eq!(resolver.get("lib").unwrap().config.get("platform", "name"), Some("ci"));
    }
}
