extern crate globset;
extern crate mlua;

use crate::attr::
{
    RawTargetNode,
    RawValue,
    SELECT_MARKER,
};
use crate::cell::CellResolver;
use crate::config::ImplicitIncludeMap;
use crate::rules::Registry;
use crate::system::System;
use crate::system::util::read_file_to_string;
use crate::target::BuildTarget;
use globset::
{
    GlobBuilder,
    GlobSet,
    GlobSetBuilder,
};
use mlua::
{
    Lua,
    Table,
    Value,
    Variadic,
};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum ParseErrorKind
{
    Syntax,
    Evaluation,
    MissingBuildFile,
    MissingLoad,
    BadLoadLabel,
    LoadCycle,
    MissingLoadSymbol,
    UndefinedImplicitSymbol,
    DuplicateTarget,
    ForbiddenAtTopLevel,
    TopLevelFunction,
    BadTargetName,
    BadAttribute,
    BadGlobPattern,
    Internal,
}

/*  A typed evaluation failure: what went wrong and where.  The
    location is the build file or extension label involved. */
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError
{
    pub kind : ParseErrorKind,
    pub location : String,
    pub message : String,
}

impl ParseError
{
    pub fn new(kind : ParseErrorKind, location : &str, message : String) -> ParseError
    {
        ParseError
        {
            kind : kind,
            location : location.to_string(),
            message : message,
        }
    }
}

impl fmt::Display for ParseError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        write!(formatter, "{}: {}", self.location, self.message)
    }
}

/*  One recorded glob invocation: the patterns and what they expanded
    to at parse time.  Re-expanding later and comparing tells whether
    the manifest is still valid. */
#[derive(Debug, Clone, PartialEq)]
pub struct GlobRecord
{
    pub include : Vec<String>,
    pub exclude : Vec<String>,
    pub results : Vec<String>,
}

/*  Everything one build-file evaluation produced: the declared targets
    plus a record of every outside fact the evaluation consulted.  Two
    evaluations with the same file contents, loads, config values and
    glob expansions render identically. */
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest
{
    pub cell : String,
    pub package : String,
    pub targets : BTreeMap<String, RawTargetNode>,
    pub includes : Vec<String>,
    pub config_reads : Vec<(String, String, Option<String>)>,
    pub globs : Vec<GlobRecord>,
}

impl Manifest
{
    pub fn render(&self) -> String
    {
        let mut out = format!("package {}//{}\n", self.cell, self.package);
        for include in &self.includes
        {
            out.push_str(&format!("include {}\n", include));
        }
        for (section, key, value) in &self.config_reads
        {
            out.push_str(&format!("config {}.{} = {:?}\n", section, key, value));
        }
        for glob in &self.globs
        {
            out.push_str(&format!(
                "glob include={:?} exclude={:?} -> {:?}\n",
                glob.include, glob.exclude, glob.results));
        }
        for (_name, target) in &self.targets
        {
            out.push_str(&target.render());
        }
        out
    }
}

enum ExtensionState
{
    Loading,
    Loaded(Table),
}

/*  State shared between the evaluator and its Lua callbacks.  Borrows
    are never held across a chunk execution, which is what makes the
    re-entrancy of load() safe. */
struct Shared<SystemType : System>
{
    system : SystemType,
    cells : CellResolver,
    registry : Arc<Registry>,
    implicit_includes : HashMap<String, ImplicitIncludeMap>,
    prototype : Option<Table>,

    /*  UNLOADED (absent) -> Loading -> Loaded, keyed by on-disk path.
        Finding Loading again on the way down is a load cycle.  The
        cache lives for one command; a fresh command builds a fresh
        evaluator, which is how file edits invalidate it. */
    extension_states : HashMap<String, ExtensionState>,

    cell_name : String,
    package : String,
    extension_depth : usize,
    env_stack : Vec<Table>,
    implicit_symbols : Option<Table>,
    injected_names : HashSet<String>,
    targets : BTreeMap<String, RawTargetNode>,
    includes : Vec<String>,
    config_reads : Vec<(String, String, Option<String>)>,
    globs : Vec<GlobRecord>,
    error : Option<ParseError>,
}

fn internal_error(message : String) -> ParseError
{
    ParseError::new(ParseErrorKind::Internal, "", message)
}

/*  Records the typed error (keeping the innermost one) and produces
    the Lua error that unwinds the chunk. */
fn raise<SystemType : System>(
    shared : &Rc<RefCell<Shared<SystemType>>>,
    error : ParseError) -> mlua::Error
{
    let message = format!("{}", error);
    let mut sh = shared.borrow_mut();
    if sh.error.is_none()
    {
        sh.error = Some(error);
    }
    mlua::Error::runtime(message)
}

fn lua_problem(error : mlua::Error) -> ParseError
{
    internal_error(format!("lua error: {}", error))
}

/*  A fresh sandboxed environment: the prototype's primitives, with the
    standard-library tables shallow-copied so one build file cannot
    monkey-patch another's. */
fn make_env<SystemType : System>(
    lua : &Lua,
    shared : &Rc<RefCell<Shared<SystemType>>>) -> Result<Table, ParseError>
{
    let prototype =
    match shared.borrow().prototype.clone()
    {
        Some(prototype) => prototype,
        None => return Err(internal_error("environment prototype missing".to_string())),
    };

    let env = lua.create_table().map_err(lua_problem)?;
    for pair in prototype.pairs::<String, Value>()
    {
        let (key, value) = pair.map_err(lua_problem)?;
        match value
        {
            Value::Table(table) =>
            {
                let copy = lua.create_table().map_err(lua_problem)?;
                for inner in table.pairs::<Value, Value>()
                {
                    let (inner_key, inner_value) = inner.map_err(lua_problem)?;
                    copy.set(inner_key, inner_value).map_err(lua_problem)?;
                }
                env.set(key.clone(), copy).map_err(lua_problem)?;
            },
            other =>
            {
                env.set(key.clone(), other).map_err(lua_problem)?;
            },
        }
        shared.borrow_mut().injected_names.insert(key);
    }
    Ok(env)
}

/*  Expands a glob against the package directory through the System.
    The walk does not descend into subdirectories that carry their own
    build file: those files belong to another package. */
pub fn compute_glob<SystemType : System>(
    system : &SystemType,
    cells : &CellResolver,
    cell_name : &str,
    package : &str,
    include : &Vec<String>,
    exclude : &Vec<String>) -> Result<Vec<String>, ParseError>
{
    let cell =
    match cells.get(cell_name)
    {
        Ok(cell) => cell,
        Err(error) => return Err(internal_error(format!("{}", error))),
    };

    let build_glob_set = |patterns : &Vec<String>| -> Result<GlobSet, ParseError>
    {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns
        {
            let glob =
            match GlobBuilder::new(pattern).literal_separator(true).build()
            {
                Ok(glob) => glob,
                Err(error) => return Err(ParseError::new(
                    ParseErrorKind::BadGlobPattern,
                    pattern,
                    format!("bad glob pattern: {}", error))),
            };
            builder.add(glob);
        }
        match builder.build()
        {
            Ok(set) => Ok(set),
            Err(error) => Err(internal_error(format!("glob set failed to build: {}", error))),
        }
    };

    let include_set = build_glob_set(include)?;
    let exclude_set = build_glob_set(exclude)?;

    let package_dir = cell.package_dir(package);
    let build_file_name = cell.build_file_name.clone();

    let mut results = vec![];
    let mut pending : Vec<(String, String)> = vec![(package_dir, "".to_string())];

    while let Some((dir, prefix)) = pending.pop()
    {
        let listing_path = if dir == "" { ".".to_string() } else { dir };
        let children =
        match system.list_dir(&listing_path)
        {
            Ok(children) => children,
            Err(_error) => continue,
        };

        for child in children
        {
            let name =
            match child.rfind('/')
            {
                Some(index) => child[index+1..].to_string(),
                None => child.clone(),
            };

            let relative =
            if prefix == ""
            {
                name.clone()
            }
            else
            {
                format!("{}/{}", prefix, name)
            };

            if system.is_dir(&child)
            {
                if !system.is_file(&format!("{}/{}", child, build_file_name))
                {
                    pending.push((child, relative));
                }
            }
            else if system.is_file(&child)
            {
                if prefix == "" && name == build_file_name
                {
                    continue;
                }

                let as_path = std::path::Path::new(&relative);
                if include_set.is_match(as_path) && !exclude_set.is_match(as_path)
                {
                    results.push(relative);
                }
            }
        }
    }

    results.sort();
    Ok(results)
}

/*  Loads an extension file, caching the evaluated namespace and
    detecting dynamic load cycles. */
fn load_extension<SystemType : System>(
    lua : &Lua,
    shared : &Rc<RefCell<Shared<SystemType>>>,
    path : &str,
    label : &str) -> Result<Table, ParseError>
{
    {
        let mut sh = shared.borrow_mut();
        match sh.extension_states.get(path)
        {
            Some(ExtensionState::Loading) =>
            {
                return Err(ParseError::new(
                    ParseErrorKind::LoadCycle,
                    label,
                    format!("load cycle through extension: {}", path)));
            },
            Some(ExtensionState::Loaded(namespace)) =>
            {
                let namespace = namespace.clone();
                sh.includes.push(path.to_string());
                return Ok(namespace);
            },
            None => {},
        }
        sh.extension_states.insert(path.to_string(), ExtensionState::Loading);
        sh.includes.push(path.to_string());
    }

    let system = shared.borrow().system.clone();
    let source =
    match read_file_to_string(&system, path)
    {
        Ok(source) => source,
        Err(_error) =>
        {
            shared.borrow_mut().extension_states.remove(path);
            return Err(ParseError::new(
                ParseErrorKind::MissingLoad,
                label,
                format!("extension file not found: {}", path)));
        },
    };

    let env = make_env(lua, shared)?;

    {
        let mut sh = shared.borrow_mut();
        sh.env_stack.push(env.clone());
        sh.extension_depth += 1;
    }

    let result = lua.load(&source).set_name(path).set_environment(env.clone()).exec();

    {
        let mut sh = shared.borrow_mut();
        sh.env_stack.pop();
        sh.extension_depth -= 1;
    }

    match result
    {
        Ok(()) =>
        {
            shared.borrow_mut().extension_states.insert(
                path.to_string(), ExtensionState::Loaded(env.clone()));
            Ok(env)
        },
        Err(error) =>
        {
            shared.borrow_mut().extension_states.remove(path);
            Err(take_or_classify(shared, error, path))
        },
    }
}

/*  The typed error recorded by a callback wins; otherwise classify the
    raw Lua error. */
fn take_or_classify<SystemType : System>(
    shared : &Rc<RefCell<Shared<SystemType>>>,
    error : mlua::Error,
    location : &str) -> ParseError
{
    match shared.borrow_mut().error.take()
    {
        Some(typed) => return typed,
        None => {},
    }

    match error
    {
        mlua::Error::SyntaxError{message, ..} =>
            ParseError::new(ParseErrorKind::Syntax, location, message),

        other =>
            ParseError::new(ParseErrorKind::Evaluation, location, format!("{}", other)),
    }
}

fn check_target_name(name : &str) -> bool
{
    if name == ""
    {
        return false;
    }
    name.chars().all(
        |c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '+')
}

/*  The sandboxed build-file evaluator.  One of these lives on each
    parser worker thread, carrying its own Lua VM.  Extension
    namespaces and their load-state machine are cached for the life of
    the evaluator, which is one command. */
pub struct Evaluator<SystemType : System>
{
    lua : Lua,
    shared : Rc<RefCell<Shared<SystemType>>>,
}

impl<SystemType : System + 'static> Evaluator<SystemType>
{
    pub fn new(
        system : SystemType,
        cells : CellResolver,
        registry : Arc<Registry>) -> Result<Evaluator<SystemType>, ParseError>
    {
        let mut implicit_includes = HashMap::new();
        for cell_name in cells.cell_names()
        {
            let cell = cells.get(&cell_name).unwrap();
            let map =
            match ImplicitIncludeMap::from_config(&cell.config)
            {
                Ok(map) => map,
                Err(error) => return Err(ParseError::new(
                    ParseErrorKind::Evaluation,
                    &cell_name,
                    format!("{}", error))),
            };
            implicit_includes.insert(cell_name, map);
        }

        let lua = Lua::new();
        let shared = Rc::new(RefCell::new(Shared
        {
            system : system,
            cells : cells,
            registry : registry,
            implicit_includes : implicit_includes,
            prototype : None,
            extension_states : HashMap::new(),
            cell_name : "".to_string(),
            package : "".to_string(),
            extension_depth : 0,
            env_stack : vec![],
            implicit_symbols : None,
            injected_names : HashSet::new(),
            targets : BTreeMap::new(),
            includes : vec![],
            config_reads : vec![],
            globs : vec![],
            error : None,
        }));

        let prototype = Evaluator::build_prototype(&lua, &shared)?;
        shared.borrow_mut().prototype = Some(prototype);

        Ok(Evaluator
        {
            lua : lua,
            shared : shared,
        })
    }

    /*  Assembles the environment prototype: every primitive, every rule
        constructor, and a pure slice of the standard library.  There is
        no os, io, require, pcall or error in here; the dialect has no
        exceptions and no dynamic loading besides load(). */
    fn build_prototype(
        lua : &Lua,
        shared : &Rc<RefCell<Shared<SystemType>>>) -> Result<Table, ParseError>
    {
        let prototype = lua.create_table().map_err(lua_problem)?;
        let globals = lua.globals();

        for name in ["string", "table", "math", "ipairs", "pairs", "next", "tostring", "tonumber", "type"].iter()
        {
            let value : Value = globals.get(*name).map_err(lua_problem)?;
            prototype.set(*name, value).map_err(lua_problem)?;
        }

        /*  Rule constructors, one per registered rule type. */
        let rule_names = shared.borrow().registry.names();
        for rule_name in rule_names
        {
            let shared_clone = shared.clone();
            let constructor_name = rule_name.clone();
            let constructor = lua.create_function(
                move |_lua, spec : Table| -> mlua::Result<()>
                {
                    rule_constructor_body(&shared_clone, &constructor_name, spec)
                }).map_err(lua_problem)?;
            prototype.set(rule_name.as_str(), constructor).map_err(lua_problem)?;
        }

        /*  load("[@cell]//path:file.lua", "symbol", { alias = "symbol" }) */
        {
            let shared_clone = shared.clone();
            let load_fn = lua.create_function(
                move |lua, (label, imports) : (String, Variadic<Value>)| -> mlua::Result<()>
                {
                    load_body(lua, &shared_clone, &label, imports)
                }).map_err(lua_problem)?;
            prototype.set("load", load_fn).map_err(lua_problem)?;
        }

        /*  glob{"pattern", ..., exclude = {"pattern", ...}} */
        {
            let shared_clone = shared.clone();
            let glob_fn = lua.create_function(
                move |lua, spec : Table| -> mlua::Result<Table>
                {
                    glob_body(lua, &shared_clone, spec)
                }).map_err(lua_problem)?;
            prototype.set("glob", glob_fn).map_err(lua_problem)?;
        }

        {
            let shared_clone = shared.clone();
            let package_name_fn = lua.create_function(
                move |_lua, () : ()| -> mlua::Result<String>
                {
                    Ok(shared_clone.borrow().package.clone())
                }).map_err(lua_problem)?;
            prototype.set("package_name", package_name_fn).map_err(lua_problem)?;
        }

        {
            let shared_clone = shared.clone();
            let repository_name_fn = lua.create_function(
                move |_lua, () : ()| -> mlua::Result<String>
                {
                    Ok(shared_clone.borrow().cell_name.clone())
                }).map_err(lua_problem)?;
            prototype.set("repository_name", repository_name_fn).map_err(lua_problem)?;
        }

        /*  read_config(section, key, default) records the observed
            value, which is part of the manifest's identity. */
        {
            let shared_clone = shared.clone();
            let read_config_fn = lua.create_function(
                move |_lua, (section, key, default) : (String, String, Option<String>)|
                    -> mlua::Result<Option<String>>
                {
                    let mut sh = shared_clone.borrow_mut();
                    let cell_name = sh.cell_name.clone();
                    let observed = match sh.cells.get(&cell_name)
                    {
                        Ok(cell) => cell.config.get(&section, &key).map(|value| value.to_string()),
                        Err(_error) => None,
                    };
                    sh.config_reads.push((section, key, observed.clone()));
                    Ok(observed.or(default))
                }).map_err(lua_problem)?;
            prototype.set("read_config", read_config_fn).map_err(lua_problem)?;
        }

        {
            let shared_clone = shared.clone();
            let implicit_fn = lua.create_function(
                move |_lua, (name, default) : (String, Option<Value>)| -> mlua::Result<Value>
                {
                    let symbols = shared_clone.borrow().implicit_symbols.clone();
                    let found : Value =
                    match symbols
                    {
                        Some(table) =>
                        {
                            match table.get::<Value>(name.as_str())
                            {
                                Ok(value) => value,
                                Err(_) => Value::Nil,
                            }
                        },
                        None => Value::Nil,
                    };

                    match found
                    {
                        Value::Nil =>
                        {
                            match default
                            {
                                Some(default) => Ok(default),
                                None =>
                                {
                                    let package = shared_clone.borrow().package.clone();
                                    Err(raise(&shared_clone, ParseError::new(
                                        ParseErrorKind::UndefinedImplicitSymbol,
                                        &package,
                                        format!("implicit package symbol not defined: {}", name))))
                                },
                            }
                        },
                        value => Ok(value),
                    }
                }).map_err(lua_problem)?;
            prototype.set("implicit_package_symbol", implicit_fn).map_err(lua_problem)?;
        }

        {
            let shared_clone = shared.clone();
            let rule_exists_fn = lua.create_function(
                move |_lua, name : String| -> mlua::Result<bool>
                {
                    Ok(shared_clone.borrow().registry.rule_exists(&name))
                }).map_err(lua_problem)?;
            prototype.set("rule_exists", rule_exists_fn).map_err(lua_problem)?;
        }

        {
            let struct_fn = lua.create_function(
                move |_lua, spec : Table| -> mlua::Result<Table>
                {
                    Ok(spec)
                }).map_err(lua_problem)?;
            prototype.set("struct", struct_fn).map_err(lua_problem)?;
        }

        {
            let provider_fn = lua.create_function(
                move |lua, _spec : Table| -> mlua::Result<mlua::Function>
                {
                    lua.create_function(|_lua, instance : Table| -> mlua::Result<Table>
                    {
                        Ok(instance)
                    })
                }).map_err(lua_problem)?;
            prototype.set("provider", provider_fn).map_err(lua_problem)?;
        }

        /*  select{...} just tags the table; conversion and resolution
            happen later against the active platform. */
        {
            let select_fn = lua.create_function(
                move |_lua, spec : Table| -> mlua::Result<Table>
                {
                    spec.set(SELECT_MARKER, true)?;
                    Ok(spec)
                }).map_err(lua_problem)?;
            prototype.set("select", select_fn).map_err(lua_problem)?;
        }

        Ok(prototype)
    }

    /*  Evaluates the build file of one package into a manifest. */
    pub fn evaluate(&self, cell_name : &str, package : &str) -> Result<Manifest, ParseError>
    {
        let (build_file_path, system) =
        {
            let mut sh = self.shared.borrow_mut();
            sh.cell_name = cell_name.to_string();
            sh.package = package.to_string();
            sh.extension_depth = 0;
            sh.env_stack.clear();
            sh.implicit_symbols = None;
            sh.injected_names.clear();
            sh.targets.clear();
            sh.includes.clear();
            sh.config_reads.clear();
            sh.globs.clear();
            sh.error = None;

            let cell =
            match sh.cells.get(cell_name)
            {
                Ok(cell) => cell,
                Err(error) => return Err(internal_error(format!("{}", error))),
            };
            (cell.build_file_path(package), sh.system.clone())
        };

        let source =
        match read_file_to_string(&system, &build_file_path)
        {
            Ok(source) => source,
            Err(_error) => return Err(ParseError::new(
                ParseErrorKind::MissingBuildFile,
                &build_file_path,
                format!("build file not found: {}", build_file_path))),
        };

        let env = make_env(&self.lua, &self.shared)?;

        /*  Implicit per-package includes, injected before the chunk
            runs.  Deepest matching prefix wins. */
        let implicit =
        {
            let sh = self.shared.borrow();
            match sh.implicit_includes.get(cell_name)
            {
                Some(map) => map.lookup(package).cloned(),
                None => None,
            }
        };

        match implicit
        {
            Some(include) =>
            {
                let path = self.extension_path(&include.label, cell_name, package)?;
                let namespace = load_extension(&self.lua, &self.shared, &path, &include.label)?;

                let symbols_table = self.lua.create_table().map_err(lua_problem)?;
                for (alias, symbol) in &include.symbols
                {
                    let value : Value = namespace.get(symbol.as_str()).map_err(lua_problem)?;
                    match value
                    {
                        Value::Nil =>
                        {
                            return Err(ParseError::new(
                                ParseErrorKind::MissingLoadSymbol,
                                &include.label,
                                format!("implicit include does not define symbol: {}", symbol)));
                        },
                        value =>
                        {
                            env.set(alias.as_str(), value.clone()).map_err(lua_problem)?;
                            symbols_table.set(alias.as_str(), value).map_err(lua_problem)?;
                        },
                    }
                }

                let mut sh = self.shared.borrow_mut();
                sh.implicit_symbols = Some(symbols_table);
                for (alias, _symbol) in &include.symbols
                {
                    sh.injected_names.insert(alias.clone());
                }
            },
            None => {},
        }

        self.shared.borrow_mut().env_stack.push(env.clone());

        let result = self.lua
            .load(&source)
            .set_name(build_file_path.as_str())
            .set_environment(env.clone())
            .exec();

        self.shared.borrow_mut().env_stack.pop();

        match result
        {
            Ok(()) => {},
            Err(error) => return Err(take_or_classify(&self.shared, error, &build_file_path)),
        }

        /*  Build files declare targets; they do not define functions.
            Anything callable left in the environment that we did not
            put there ourselves is a policy violation. */
        {
            let sh = self.shared.borrow();
            for pair in env.pairs::<String, Value>()
            {
                let (key, value) = pair.map_err(lua_problem)?;
                match value
                {
                    Value::Function(_) =>
                    {
                        if !sh.injected_names.contains(&key)
                        {
                            return Err(ParseError::new(
                                ParseErrorKind::TopLevelFunction,
                                &build_file_path,
                                format!("build files may not define functions at top level: {}", key)));
                        }
                    },
                    _ => {},
                }
            }
        }

        let mut sh = self.shared.borrow_mut();
        let mut seen = HashSet::new();
        let mut includes = vec![];
        for include in sh.includes.drain(..)
        {
            if seen.insert(include.clone())
            {
                includes.push(include);
            }
        }

        Ok(Manifest
        {
            cell : cell_name.to_string(),
            package : package.to_string(),
            targets : std::mem::take(&mut sh.targets),
            includes : includes,
            config_reads : std::mem::take(&mut sh.config_reads),
            globs : std::mem::take(&mut sh.globs),
        })
    }

    /*  The ordered list of extension files the package's build file
        pulls in, directly or transitively. */
    pub fn get_includes(&self, cell_name : &str, package : &str) -> Result<Vec<String>, ParseError>
    {
        Ok(self.evaluate(cell_name, package)?.includes)
    }

    /*  Recomputes the recorded globs and reports whether they all still
        expand the same way. */
    pub fn glob_result_still_valid(
        &self,
        cell_name : &str,
        package : &str,
        recorded : &Vec<GlobRecord>) -> Result<bool, ParseError>
    {
        let (system, cells) =
        {
            let sh = self.shared.borrow();
            (sh.system.clone(), sh.cells.clone())
        };

        for record in recorded
        {
            let fresh = compute_glob(
                &system, &cells, cell_name, package, &record.include, &record.exclude)?;
            if fresh != record.results
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn extension_path(
        &self,
        label : &str,
        cell_name : &str,
        package : &str) -> Result<String, ParseError>
    {
        extension_path_for(&self.shared, label, cell_name, package)
    }
}

fn extension_path_for<SystemType : System>(
    shared : &Rc<RefCell<Shared<SystemType>>>,
    label : &str,
    cell_name : &str,
    package : &str) -> Result<String, ParseError>
{
    let target =
    match BuildTarget::parse(label, cell_name, Some(package))
    {
        Ok(target) => target,
        Err(error) => return Err(ParseError::new(
            ParseErrorKind::BadLoadLabel,
            label,
            format!("{}", error))),
    };

    let sh = shared.borrow();
    let cell =
    match sh.cells.get(&target.cell)
    {
        Ok(cell) => cell,
        Err(error) => return Err(ParseError::new(
            ParseErrorKind::BadLoadLabel,
            label,
            format!("{}", error))),
    };

    let cell_relative =
    if target.base_path == ""
    {
        target.short_name.clone()
    }
    else
    {
        format!("{}/{}", target.base_path, target.short_name)
    };

    Ok(cell.source_path(&cell_relative))
}

fn rule_constructor_body<SystemType : System>(
    shared : &Rc<RefCell<Shared<SystemType>>>,
    rule_name : &str,
    spec : Table) -> mlua::Result<()>
{
    {
        let sh = shared.borrow();
        if sh.extension_depth > 0
        {
            let package = sh.package.clone();
            drop(sh);
            return Err(raise(shared, ParseError::new(
                ParseErrorKind::ForbiddenAtTopLevel,
                &package,
                format!(
                    "native rule constructor {} may not run at the top level of an extension",
                    rule_name))));
        }
    }

    let name : String =
    match spec.get::<Option<String>>("name")
    {
        Ok(Some(name)) => name,
        _ =>
        {
            let package = shared.borrow().package.clone();
            return Err(raise(shared, ParseError::new(
                ParseErrorKind::BadTargetName,
                &package,
                format!("{} declaration is missing a name", rule_name))));
        },
    };

    if !check_target_name(&name)
    {
        let package = shared.borrow().package.clone();
        return Err(raise(shared, ParseError::new(
            ParseErrorKind::BadTargetName,
            &package,
            format!("malformed target name: {}", name))));
    }

    let mut attrs = BTreeMap::new();
    for pair in spec.pairs::<Value, Value>()
    {
        let (key, value) = pair?;
        let key_text =
        match &key
        {
            Value::String(text) =>
            {
                match text.to_str()
                {
                    Ok(text) => text.to_string(),
                    Err(_) => continue,
                }
            },
            _ =>
            {
                let package = shared.borrow().package.clone();
                return Err(raise(shared, ParseError::new(
                    ParseErrorKind::BadAttribute,
                    &package,
                    format!("attributes of {} must be named, not positional", name))));
            },
        };

        if key_text == "name"
        {
            continue;
        }

        match RawValue::from_lua(&value)
        {
            Ok(raw) =>
            {
                attrs.insert(key_text, raw);
            },
            Err(error) =>
            {
                let package = shared.borrow().package.clone();
                return Err(raise(shared, ParseError::new(
                    ParseErrorKind::BadAttribute,
                    &package,
                    format!("attribute {} of {}: {}", key_text, name, error))));
            },
        }
    }

    let mut sh = shared.borrow_mut();
    if sh.targets.contains_key(&name)
    {
        let package = sh.package.clone();
        drop(sh);
        return Err(raise(shared, ParseError::new(
            ParseErrorKind::DuplicateTarget,
            &package,
            format!("two targets declared with the same name: {}", name))));
    }

    sh.targets.insert(
        name.clone(),
        RawTargetNode
        {
            name : name,
            rule_type : rule_name.to_string(),
            attrs : attrs,
        });
    Ok(())
}

fn load_body<SystemType : System>(
    lua : &Lua,
    shared : &Rc<RefCell<Shared<SystemType>>>,
    label : &str,
    imports : Variadic<Value>) -> mlua::Result<()>
{
    let (cell_name, package) =
    {
        let sh = shared.borrow();
        (sh.cell_name.clone(), sh.package.clone())
    };

    let path =
    match extension_path_for(shared, label, &cell_name, &package)
    {
        Ok(path) => path,
        Err(error) => return Err(raise(shared, error)),
    };

    let namespace =
    match load_extension(lua, shared, &path, label)
    {
        Ok(namespace) => namespace,
        Err(error) => return Err(raise(shared, error)),
    };

    let env_in_scope = shared.borrow().env_stack.last().cloned();
    let env =
    match env_in_scope
    {
        Some(env) => env,
        None => return Err(raise(shared, internal_error(
            "load() called with no environment in scope".to_string()))),
    };

    let mut inject = |alias : String, symbol : String| -> mlua::Result<()>
    {
        let value : Value = namespace.get(symbol.as_str())?;
        match value
        {
            Value::Nil =>
            {
                Err(raise(shared, ParseError::new(
                    ParseErrorKind::MissingLoadSymbol,
                    label,
                    format!("extension does not define symbol: {}", symbol))))
            },
            value =>
            {
                env.set(alias.as_str(), value)?;
                shared.borrow_mut().injected_names.insert(alias);
                Ok(())
            },
        }
    };

    for import in imports
    {
        match import
        {
            Value::String(text) =>
            {
                let symbol =
                match text.to_str()
                {
                    Ok(symbol) => symbol.to_string(),
                    Err(_) => return Err(raise(shared, ParseError::new(
                        ParseErrorKind::MissingLoadSymbol,
                        label,
                        "load() symbol names must be strings".to_string()))),
                };
                inject(symbol.clone(), symbol)?;
            },
            Value::Table(aliases) =>
            {
                for pair in aliases.pairs::<String, String>()
                {
                    let (alias, symbol) = pair?;
                    inject(alias, symbol)?;
                }
            },
            _ =>
            {
                return Err(raise(shared, ParseError::new(
                    ParseErrorKind::MissingLoadSymbol,
                    label,
                    "load() imports must be symbol names or alias tables".to_string())));
            },
        }
    }

    Ok(())
}

fn glob_body<SystemType : System>(
    lua : &Lua,
    shared : &Rc<RefCell<Shared<SystemType>>>,
    spec : Table) -> mlua::Result<Table>
{
    {
        let sh = shared.borrow();
        if sh.extension_depth > 0
        {
            let package = sh.package.clone();
            drop(sh);
            return Err(raise(shared, ParseError::new(
                ParseErrorKind::ForbiddenAtTopLevel,
                &package,
                "glob may not run at the top level of an extension".to_string())));
        }
    }

    let mut include = vec![];
    for item in spec.sequence_values::<String>()
    {
        include.push(item?);
    }

    let mut exclude = vec![];
    match spec.get::<Option<Table>>("exclude")
    {
        Ok(Some(patterns)) =>
        {
            for item in patterns.sequence_values::<String>()
            {
                exclude.push(item?);
            }
        },
        _ => {},
    }

    let (system, cells, cell_name, package) =
    {
        let sh = shared.borrow();
        (sh.system.clone(), sh.cells.clone(), sh.cell_name.clone(), sh.package.clone())
    };

    let results =
    match compute_glob(&system, &cells, &cell_name, &package, &include, &exclude)
    {
        Ok(results) => results,
        Err(error) => return Err(raise(shared, error)),
    };

    shared.borrow_mut().globs.push(GlobRecord
    {
        include : include,
        exclude : exclude,
        results : results.clone(),
    });

    let output = lua.create_table()?;
    for (index, path) in results.into_iter().enumerate()
    {
        output.set(index + 1, path)?;
    }
    Ok(output)
}
