use crate::attr::
{
    RawValue,
};
use crate::cell::CellResolver;
use crate::config::Platform;
use crate::target::
{
    BuildTarget,
    TargetParseError,
};
use std::fmt;

/*  The declared type of one rule attribute.  Each rule description
    publishes a schema of these; the resolver coerces raw values against
    it. */
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttrType
{
    Str,
    OptStr,
    Int,
    Bool,
    StrList,
    SourceList,
    Dep,
    DepList,
    TargetList,
}

impl fmt::Display for AttrType
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            AttrType::Str => write!(formatter, "string"),
            AttrType::OptStr => write!(formatter, "optional string"),
            AttrType::Int => write!(formatter, "integer"),
            AttrType::Bool => write!(formatter, "boolean"),
            AttrType::StrList => write!(formatter, "list of strings"),
            AttrType::SourceList => write!(formatter, "list of sources"),
            AttrType::Dep => write!(formatter, "target"),
            AttrType::DepList => write!(formatter, "list of targets"),
            AttrType::TargetList => write!(formatter, "list of targets"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttrSpec
{
    pub name : &'static str,
    pub attr_type : AttrType,
    pub required : bool,
}

impl AttrSpec
{
    pub fn required(name : &'static str, attr_type : AttrType) -> AttrSpec
    {
        AttrSpec{name : name, attr_type : attr_type, required : true}
    }

    pub fn optional(name : &'static str, attr_type : AttrType) -> AttrSpec
    {
        AttrSpec{name : name, attr_type : attr_type, required : false}
    }
}

/*  A member of a source list: either a file in the owning cell or a
    reference to another target whose outputs feed in. */
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum SourceRef
{
    File(String),
    Target(BuildTarget),
}

/*  A typed, fully resolved attribute value. */
#[derive(Debug, Clone, PartialEq)]
pub enum CoercedAttr
{
    Str(String),
    OptStr(Option<String>),
    Int(i64),
    Bool(bool),
    StrList(Vec<String>),
    Sources(Vec<SourceRef>),
    Dep(BuildTarget),
    Deps(Vec<BuildTarget>),
    Targets(Vec<BuildTarget>),
}

impl CoercedAttr
{
    pub fn as_str(&self) -> Option<&str>
    {
        match self
        {
            CoercedAttr::Str(text) => Some(text),
            CoercedAttr::OptStr(Some(text)) => Some(text),
            _ => None,
        }
    }

    pub fn as_str_list(&self) -> Option<&Vec<String>>
    {
        match self
        {
            CoercedAttr::StrList(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_sources(&self) -> Option<&Vec<SourceRef>>
    {
        match self
        {
            CoercedAttr::Sources(sources) => Some(sources),
            _ => None,
        }
    }

    pub fn as_dep(&self) -> Option<&BuildTarget>
    {
        match self
        {
            CoercedAttr::Dep(target) => Some(target),
            _ => None,
        }
    }

    pub fn as_deps(&self) -> Option<&Vec<BuildTarget>>
    {
        match self
        {
            CoercedAttr::Deps(targets) => Some(targets),
            CoercedAttr::Targets(targets) => Some(targets),
            _ => None,
        }
    }
}

/*  An unsatisfiable select is a configuration problem, not a type
    problem, so it gets its own kind. */
#[derive(Debug, PartialEq)]
pub enum ConfigurationError
{
    UnsatisfiedSelect
    {
        attribute : String,
        conditions : Vec<String>,
        platform : String,
    },
}

impl fmt::Display for ConfigurationError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            ConfigurationError::UnsatisfiedSelect{attribute, conditions, platform} =>
                write!(
                    formatter,
                    "No select() condition matched platform {} for attribute {} (conditions: {}) and there is no DEFAULT branch",
                    platform,
                    attribute,
                    conditions.join(", ")),
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum CoerceError
{
    WrongType
    {
        attribute : String,
        expected : String,
        found : String,
    },
    MissingAttribute(String),
    UnknownAttribute(String),
    BadTarget(String, TargetParseError),
    UnknownCellRef(String, String),
    BadPath(String, String),
    BadVisibility(String),
    Configuration(ConfigurationError),
}

impl fmt::Display for CoerceError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            CoerceError::WrongType{attribute, expected, found} =>
                write!(formatter, "Attribute {} expected {}, found: {}", attribute, expected, found),

            CoerceError::MissingAttribute(attribute) =>
                write!(formatter, "Required attribute missing: {}", attribute),

            CoerceError::UnknownAttribute(attribute) =>
                write!(formatter, "Rule does not declare an attribute named: {}", attribute),

            CoerceError::BadTarget(attribute, error) =>
                write!(formatter, "Attribute {} has a malformed target label: {}", attribute, error),

            CoerceError::UnknownCellRef(attribute, cell) =>
                write!(formatter, "Attribute {} refers to unknown cell: {}", attribute, cell),

            CoerceError::BadPath(attribute, path) =>
                write!(formatter, "Attribute {} has a path that leaves the package: {}", attribute, path),

            CoerceError::BadVisibility(text) =>
                write!(formatter, "Malformed visibility pattern: {}", text),

            CoerceError::Configuration(error) =>
                write!(formatter, "{}", error),
        }
    }
}

/*  Everything coercion needs to know about where an attribute came
    from. */
pub struct CoerceContext<'a>
{
    pub cells : &'a CellResolver,
    pub platform : &'a Platform,
    pub cell : &'a str,
    pub package : &'a str,
}

/*  Replaces every selector list in the value with the branch chosen by
    the active platform: the first satisfied condition in canonical
    order, then the DEFAULT branch, otherwise a configuration error. */
pub fn resolve_selects(
    value : &RawValue,
    attribute : &str,
    platform : &Platform) -> Result<RawValue, CoerceError>
{
    match value
    {
        RawValue::Select(selector) =>
        {
            for (condition, branch) in &selector.entries
            {
                if platform.satisfies(condition)
                {
                    return resolve_selects(branch, attribute, platform);
                }
            }

            match &selector.default
            {
                Some(branch) => resolve_selects(branch, attribute, platform),
                None => Err(CoerceError::Configuration(
                    ConfigurationError::UnsatisfiedSelect
                    {
                        attribute : attribute.to_string(),
                        conditions : selector.entries
                            .iter()
                            .map(|(condition, _branch)| condition.clone())
                            .collect(),
                        platform : platform.name.clone(),
                    })),
            }
        },

        RawValue::List(values) =>
        {
            /*  A select() inside a list that resolves to a list splices
                its items in, so srcs = {"a.c", select({...})} reads the
                way it looks. */
            let mut resolved = vec![];
            for value in values
            {
                let was_select =
                match value
                {
                    RawValue::Select(_) => true,
                    _ => false,
                };
                match (was_select, resolve_selects(value, attribute, platform)?)
                {
                    (true, RawValue::List(mut inner)) => resolved.append(&mut inner),
                    (_, item) => resolved.push(item),
                }
            }
            Ok(RawValue::List(resolved))
        },

        RawValue::Dict(pairs) =>
        {
            let mut resolved = std::collections::BTreeMap::new();
            for (key, value) in pairs
            {
                resolved.insert(key.clone(), resolve_selects(value, attribute, platform)?);
            }
            Ok(RawValue::Dict(resolved))
        },

        other => Ok(other.clone()),
    }
}

fn wrong_type(attribute : &str, attr_type : AttrType, found : &RawValue) -> CoerceError
{
    CoerceError::WrongType
    {
        attribute : attribute.to_string(),
        expected : format!("{}", attr_type),
        found : found.render(),
    }
}

fn coerce_target(
    attribute : &str,
    label : &str,
    ctx : &CoerceContext) -> Result<BuildTarget, CoerceError>
{
    let target =
    match BuildTarget::parse(label, ctx.cell, Some(ctx.package))
    {
        Ok(target) => target,
        Err(error) => return Err(CoerceError::BadTarget(attribute.to_string(), error)),
    };

    match ctx.cells.get(&target.cell)
    {
        Ok(_cell) => Ok(target),
        Err(_error) => Err(CoerceError::UnknownCellRef(attribute.to_string(), target.cell)),
    }
}

/*  Normalizes a package-relative source path to a cell-relative path.
    Paths may not climb out of the package. */
fn coerce_source_path(
    attribute : &str,
    path : &str,
    ctx : &CoerceContext) -> Result<String, CoerceError>
{
    let mut parts = vec![];
    for component in path.split('/')
    {
        match component
        {
            "" | "." => {},
            ".." => return Err(CoerceError::BadPath(attribute.to_string(), path.to_string())),
            _ => parts.push(component),
        }
    }

    if parts.len() == 0
    {
        return Err(CoerceError::BadPath(attribute.to_string(), path.to_string()));
    }

    if ctx.package == ""
    {
        Ok(parts.join("/"))
    }
    else
    {
        Ok(format!("{}/{}", ctx.package, parts.join("/")))
    }
}

fn expect_string_items(
    attribute : &str,
    attr_type : AttrType,
    value : &RawValue) -> Result<Vec<String>, CoerceError>
{
    match value
    {
        RawValue::List(values) =>
        {
            let mut items = vec![];
            for item in values
            {
                match item
                {
                    RawValue::Str(text) => items.push(text.clone()),
                    other => return Err(wrong_type(attribute, attr_type, other)),
                }
            }
            Ok(items)
        },
        other => Err(wrong_type(attribute, attr_type, other)),
    }
}

/*  Coerces one resolved (select-free) raw value against its declared
    type. */
pub fn coerce(
    value : &RawValue,
    attr_type : AttrType,
    attribute : &str,
    ctx : &CoerceContext) -> Result<CoercedAttr, CoerceError>
{
    match attr_type
    {
        AttrType::Str | AttrType::OptStr =>
        {
            match value
            {
                RawValue::Str(text) =>
                {
                    match attr_type
                    {
                        AttrType::Str => Ok(CoercedAttr::Str(text.clone())),
                        _ => Ok(CoercedAttr::OptStr(Some(text.clone()))),
                    }
                },
                other => Err(wrong_type(attribute, attr_type, other)),
            }
        },

        AttrType::Int =>
        {
            match value
            {
                RawValue::Int(number) => Ok(CoercedAttr::Int(*number)),
                other => Err(wrong_type(attribute, attr_type, other)),
            }
        },

        AttrType::Bool =>
        {
            match value
            {
                RawValue::Bool(flag) => Ok(CoercedAttr::Bool(*flag)),
                other => Err(wrong_type(attribute, attr_type, other)),
            }
        },

        AttrType::StrList =>
        {
            Ok(CoercedAttr::StrList(expect_string_items(attribute, attr_type, value)?))
        },

        AttrType::SourceList =>
        {
            let items = expect_string_items(attribute, attr_type, value)?;
            let mut sources = vec![];
            for item in items
            {
                if item.starts_with(':') || item.contains("//")
                {
                    sources.push(SourceRef::Target(coerce_target(attribute, &item, ctx)?));
                }
                else
                {
                    sources.push(SourceRef::File(coerce_source_path(attribute, &item, ctx)?));
                }
            }
            Ok(CoercedAttr::Sources(sources))
        },

        AttrType::Dep =>
        {
            match value
            {
                RawValue::Str(label) => Ok(CoercedAttr::Dep(coerce_target(attribute, label, ctx)?)),
                other => Err(wrong_type(attribute, attr_type, other)),
            }
        },

        AttrType::DepList | AttrType::TargetList =>
        {
            let items = expect_string_items(attribute, attr_type, value)?;
            let mut targets = vec![];
            for item in items
            {
                targets.push(coerce_target(attribute, &item, ctx)?);
            }
            match attr_type
            {
                AttrType::DepList => Ok(CoercedAttr::Deps(targets)),
                _ => Ok(CoercedAttr::Targets(targets)),
            }
        },
    }
}

/*  Who may depend on a target. */
#[derive(Debug, Clone, PartialEq)]
pub enum VisibilityPattern
{
    Public,
    Package
    {
        cell : String,
        base_path : String,
    },
    Subtree
    {
        cell : String,
        base_path : String,
    },
    Exact(BuildTarget),
}

impl VisibilityPattern
{
    pub fn parse(text : &str, ctx : &CoerceContext) -> Result<VisibilityPattern, CoerceError>
    {
        if text == "PUBLIC"
        {
            return Ok(VisibilityPattern::Public);
        }

        match crate::target::TargetPattern::parse(text, ctx.cell)
        {
            Ok(crate::target::TargetPattern::Single(target)) =>
                Ok(VisibilityPattern::Exact(target)),

            Ok(crate::target::TargetPattern::Package{cell, base_path}) =>
                Ok(VisibilityPattern::Package{cell : cell, base_path : base_path}),

            Ok(crate::target::TargetPattern::Recursive{cell, base_path}) =>
                Ok(VisibilityPattern::Subtree{cell : cell, base_path : base_path}),

            Err(_error) => Err(CoerceError::BadVisibility(text.to_string())),
        }
    }

    pub fn matches(&self, dependent : &BuildTarget) -> bool
    {
        match self
        {
            VisibilityPattern::Public => true,

            VisibilityPattern::Package{cell, base_path} =>
                dependent.cell == *cell && dependent.base_path == *base_path,

            VisibilityPattern::Subtree{cell, base_path} =>
                dependent.cell == *cell
                && (base_path == ""
                    || dependent.base_path == *base_path
                    || dependent.base_path.starts_with(&format!("{}/", base_path))),

            VisibilityPattern::Exact(target) =>
                dependent.cell == target.cell
                && dependent.base_path == target.base_path
                && dependent.short_name == target.short_name,
        }
    }
}

#[cfg(test)]
mod test
{
    use crate::attr::
    {
        RawValue,
        SelectorList,
    };
    use crate::cell::CellResolver;
    use crate::coerce::
    {
        AttrType,
        CoerceContext,
        CoerceError,
        CoercedAttr,
        ConfigurationError,
        SourceRef,
        VisibilityPattern,
        coerce,
        resolve_selects,
    };
    use crate::config::
    {
        Config,
        Platform,
    };
    use crate::system::fake::FakeSystem;
    use crate::target::BuildTarget;

    fn test_platform(constraints : &str) -> Platform
    {
        let mut config = Config::empty();
        config.apply_override(&format!("platform.constraints={}", constraints)).unwrap();
        Platform::from_config(&config)
    }

    fn test_cells() -> CellResolver
    {
        CellResolver::load(&FakeSystem::new(10), &vec![]).unwrap()
    }

    #[test]
    fn resolve_select_first_satisfied_condition()
    {
        let platform = test_platform("os=linux,arch=x86_64");
        let selector = RawValue::Select(SelectorList
        {
            entries : vec![
                ("os=linux".to_string(), RawValue::Str("ell".to_string())),
                ("os=macos".to_string(), RawValue::Str("em".to_string())),
            ],
            default : None,
        });

        assert_eq!(
            resolve_selects(&selector, "srcs", &platform).unwrap(),
            RawValue::Str("ell".to_string()));
    }

    #[test]
    fn resolve_select_falls_back_to_default()
    {
        let platform = test_platform("os=windows");
        let selector = RawValue::Select(SelectorList
        {
            entries : vec![
                ("os=linux".to_string(), RawValue::Str("ell".to_string())),
            ],
            default : Some(Box::new(RawValue::Str("generic".to_string()))),
        });

        assert_eq!(
            resolve_selects(&selector, "srcs", &platform).unwrap(),
            RawValue::Str("generic".to_string()));
    }

    #[test]
    fn resolve_select_without_default_is_a_configuration_error()
    {
        let platform = test_platform("os=windows");
        let selector = RawValue::Select(SelectorList
        {
            entries : vec![
                ("os=linux".to_string(), RawValue::Str("ell".to_string())),
            ],
            default : None,
        });

        match resolve_selects(&selector, "srcs", &platform)
        {
            Err(CoerceError::Configuration(ConfigurationError::UnsatisfiedSelect{attribute, ..})) =>
                assert_eq!(attribute, "srcs"),
            other => panic!("Wrong result: {:?}", other),
        }
    }

    #[test]
    fn resolve_select_inside_a_list()
    {
        let platform = test_platform("os=linux");
        let value = RawValue::List(vec![
            RawValue::Str("always.c".to_string()),
            RawValue::Select(SelectorList
            {
                entries : vec![
                    ("os=linux".to_string(), RawValue::Str("linux.c".to_string())),
                ],
                default : None,
            }),
        ]);

        assert_eq!(
            resolve_selects(&value, "srcs", &platform).unwrap(),
            RawValue::List(vec![
                RawValue::Str("always.c".to_string()),
                RawValue::Str("linux.c".to_string())]));
    }

    #[test]
    fn resolve_select_of_list_splices_into_list()
    {
        let platform = test_platform("os=linux");
        let value = RawValue::List(vec![
            RawValue::Str("always.c".to_string()),
            RawValue::Select(SelectorList
            {
                entries : vec![
                    ("os=linux".to_string(), RawValue::List(vec![
                        RawValue::Str("linux_a.c".to_string()),
                        RawValue::Str("linux_b.c".to_string())])),
                ],
                default : Some(Box::new(RawValue::List(vec![]))),
            }),
        ]);

        assert_eq!(
            resolve_selects(&value, "srcs", &platform).unwrap(),
            RawValue::List(vec![
                RawValue::Str("always.c".to_string()),
                RawValue::Str("linux_a.c".to_string()),
                RawValue::Str("linux_b.c".to_string())]));
    }

    #[test]
    fn coerce_string_and_int_and_bool()
    {
        let cells = test_cells();
        let platform = test_platform("");
        let ctx = CoerceContext{cells : &cells, platform : &platform, cell : "root", package : "pkg"};

        assert_eq!(
            coerce(&RawValue::Str("hello".to_string()), AttrType::Str, "out", &ctx).unwrap(),
            CoercedAttr::Str("hello".to_string()));
        assert_eq!(
            coerce(&RawValue::Int(9), AttrType::Int, "count", &ctx).unwrap(),
            CoercedAttr::Int(9));
        assert_eq!(
            coerce(&RawValue::Bool(true), AttrType::Bool, "flag", &ctx).unwrap(),
            CoercedAttr::Bool(true));
    }

    #[test]
    fn coerce_wrong_type_is_an_error()
    {
        let cells = test_cells();
        let platform = test_platform("");
        let ctx = CoerceContext{cells : &cells, platform : &platform, cell : "root", package : "pkg"};

        match coerce(&RawValue::Int(9), AttrType::Str, "out", &ctx)
        {
            Err(CoerceError::WrongType{attribute, ..}) => assert_eq!(attribute, "out"),
            other => panic!("Wrong result: {:?}", other),
        }
    }

    #[test]
    fn coerce_source_list_splits_files_and_targets()
    {
        let cells = test_cells();
        let platform = test_platform("");
        let ctx = CoerceContext{cells : &cells, platform : &platform, cell : "root", package : "pkg"};

        let value = RawValue::List(vec![
            RawValue::Str("a.c".to_string()),
            RawValue::Str(":generated".to_string()),
            RawValue::Str("//other:lib".to_string()),
        ]);

        match coerce(&value, AttrType::SourceList, "srcs", &ctx).unwrap()
        {
            CoercedAttr::Sources(sources) =>
            {
                assert_eq!(sources[0], SourceRef::File("pkg/a.c".to_string()));
                assert_eq!(
                    sources[1],
                    SourceRef::Target(BuildTarget::new("root", "pkg", "generated")));
                assert_eq!(
                    sources[2],
                    SourceRef::Target(BuildTarget::new("root", "other", "lib")));
            },
            other => panic!("Wrong value: {:?}", other),
        }
    }

    #[test]
    fn coerce_source_path_cannot_climb_out()
    {
        let cells = test_cells();
        let platform = test_platform("");
        let ctx = CoerceContext{cells : &cells, platform : &platform, cell : "root", package : "pkg"};

        let value = RawValue::List(vec![RawValue::Str("../outside.c".to_string())]);
        match coerce(&value, AttrType::SourceList, "srcs", &ctx)
        {
            Err(CoerceError::BadPath(attribute, _)) => assert_eq!(attribute, "srcs"),
            other => panic!("Wrong result: {:?}", other),
        }
    }

    #[test]
    fn coerce_dep_to_unknown_cell_is_an_error()
    {
        let cells = test_cells();
        let platform = test_platform("");
        let ctx = CoerceContext{cells : &cells, platform : &platform, cell : "root", package : "pkg"};

        match coerce(&RawValue::Str("mystery//pkg:dep".to_string()), AttrType::Dep, "actual", &ctx)
        {
            Err(CoerceError::UnknownCellRef(attribute, cell)) =>
            {
                assert_eq!(attribute, "actual");
                assert_eq!(cell, "mystery");
            },
            other => panic!("Wrong result: {:?}", other),
        }
    }

    #[test]
    fn visibility_patterns_match()
    {
        let cells = test_cells();
        let platform = test_platform("");
        let ctx = CoerceContext{cells : &cells, platform : &platform, cell : "root", package : "pkg"};

        let consumer = BuildTarget::new("root", "app/ui", "widget");

        assert!(VisibilityPattern::parse("PUBLIC", &ctx).unwrap().matches(&consumer));
        assert!(VisibilityPattern::parse("//app/ui:", &ctx).unwrap().matches(&consumer));
        assert!(!VisibilityPattern::parse("//app:", &ctx).unwrap().matches(&consumer));
        assert!(VisibilityPattern::parse("//app/...", &ctx).unwrap().matches(&consumer));
        assert!(!VisibilityPattern::parse("//lib/...", &ctx).unwrap().matches(&consumer));
        assert!(VisibilityPattern::parse("//app/ui:widget", &ctx).unwrap().matches(&consumer));
        assert!(!VisibilityPattern::parse("//app/ui:other", &ctx).unwrap().matches(&consumer));
    }

    #[test]
    fn malformed_visibility_is_an_error()
    {
        let cells = test_cells();
        let platform = test_platform("");
        let ctx = CoerceContext{cells : &cells, platform : &platform, cell : "root", package : "pkg"};

        match VisibilityPattern::parse("not-a-pattern", &ctx)
        {
            Err(CoerceError::BadVisibility(text)) => assert_eq!(text, "not-a-pattern"),
            other => panic!("Wrong result: {:?}", other),
        }
    }
}
