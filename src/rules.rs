use crate::action::
{
    ActionError,
    BuildRule,
    KeyField,
    SourcePathResolver,
    Step,
};
use crate::coerce::
{
    AttrSpec,
    AttrType,
    CoerceContext,
    CoerceError,
    CoercedAttr,
    SourceRef,
};
use crate::node::TargetNode;
use crate::target::BuildTarget;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind
{
    Build,
    Configuration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleType
{
    pub name : String,
    pub kind : RuleKind,
}

impl fmt::Display for RuleType
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        write!(formatter, "{}", self.name)
    }
}

/*  Everything a description sees while lowering one node: the node
    itself, the already constructed rules of its parse-time deps, and
    the path resolver. */
pub struct RuleContext<'a>
{
    pub node : &'a TargetNode,
    pub dep_rules : &'a BTreeMap<BuildTarget, Arc<BuildRule>>,
    pub paths : &'a SourcePathResolver,
}

impl<'a> RuleContext<'a>
{
    fn dep_rule(&self, dep : &BuildTarget) -> Result<&Arc<BuildRule>, ActionError>
    {
        match self.dep_rules.get(dep)
        {
            Some(rule) => Ok(rule),
            None => Err(ActionError::ConstructionFailed
            {
                target : self.node.target.clone(),
                message : format!("dep rule not constructed: {}", dep),
            }),
        }
    }
}

/*  One rule type's behavior.  The core never branches on a rule's
    identity; everything it needs comes through this interface. */
pub trait Description : Send + Sync
{
    fn rule_type(&self) -> RuleType;

    fn schema(&self) -> Vec<AttrSpec>;

    /*  Deps the description infers from attributes, beyond the ones the
        user listed.  These become parse-time edges. */
    fn implicit_deps(
        &self,
        _target : &BuildTarget,
        _attrs : &BTreeMap<String, CoercedAttr>,
        _ctx : &CoerceContext) -> Result<Vec<BuildTarget>, CoerceError>
    {
        Ok(vec![])
    }

    fn create_rule(&self, ctx : &RuleContext) -> Result<BuildRule, ActionError>;
}

/*  The open registry from rule-type name to description.  Language
    rule layers register here; the five built-ins cover the core. */
pub struct Registry
{
    by_name : BTreeMap<String, Arc<dyn Description>>,
}

impl Registry
{
    pub fn empty() -> Registry
    {
        Registry{by_name : BTreeMap::new()}
    }

    pub fn with_builtins() -> Registry
    {
        let mut registry = Registry::empty();
        registry.register(Arc::new(WriteFileDescription{}));
        registry.register(Arc::new(GenruleDescription{}));
        registry.register(Arc::new(FilegroupDescription{}));
        registry.register(Arc::new(AliasDescription{}));
        registry.register(Arc::new(ConfigSettingDescription{}));
        registry
    }

    pub fn register(&mut self, description : Arc<dyn Description>)
    {
        self.by_name.insert(description.rule_type().name, description);
    }

    pub fn get(&self, name : &str) -> Option<Arc<dyn Description>>
    {
        self.by_name.get(name).cloned()
    }

    pub fn rule_exists(&self, name : &str) -> bool
    {
        self.by_name.contains_key(name)
    }

    pub fn names(&self) -> Vec<String>
    {
        self.by_name.keys().cloned().collect()
    }
}

fn required_str<'a>(node : &'a TargetNode, attribute : &str) -> Result<&'a str, ActionError>
{
    match node.attr(attribute).and_then(|value| value.as_str())
    {
        Some(text) => Ok(text),
        None => Err(ActionError::MissingAttribute
        {
            target : node.target.clone(),
            attribute : attribute.to_string(),
        }),
    }
}

fn file_name_of(path : &str) -> &str
{
    match path.rfind('/')
    {
        Some(index) => &path[index+1..],
        None => path,
    }
}

/*  Finds every "$(location <label>)" substring and returns the labels
    in order of appearance. */
fn find_location_labels(text : &str) -> Vec<String>
{
    static OPENING : &str = "$(location ";

    let mut labels = vec![];
    let mut rest = text;
    while let Some(start) = rest.find(OPENING)
    {
        let after = &rest[start + OPENING.len()..];
        match after.find(')')
        {
            Some(end) =>
            {
                labels.push(after[..end].trim().to_string());
                rest = &after[end+1..];
            },
            None => break,
        }
    }
    labels
}

/*  Resolves the on-disk paths of a source list: plain files through the
    cell, target references through the dep's declared outputs. */
fn resolve_source_paths(
    ctx : &RuleContext,
    sources : &Vec<SourceRef>) -> Result<(Vec<String>, Vec<String>), ActionError>
{
    let mut all = vec![];
    let mut files = vec![];
    for source in sources
    {
        match source
        {
            SourceRef::File(cell_relative) =>
            {
                let path = ctx.paths.source_file(&ctx.node.target.cell, cell_relative)?;
                files.push(path.clone());
                all.push(path);
            },
            SourceRef::Target(dep) =>
            {
                for output in &ctx.dep_rule(dep)?.outputs
                {
                    all.push(output.clone());
                }
            },
        }
    }
    Ok((all, files))
}

/*  genrule: run an arbitrary command over sources.  The command may
    use $SRCS (splices every source path), $OUT, and
    $(location //some:target). */
pub struct GenruleDescription
{
}

impl GenruleDescription
{
    fn expand_in_string(
        text : &str,
        out_path : &str,
        ctx : &RuleContext) -> Result<String, ActionError>
    {
        static OPENING : &str = "$(location ";

        let mut expanded = text.replace("$OUT", out_path);
        loop
        {
            let start =
            match expanded.find(OPENING)
            {
                Some(start) => start,
                None => return Ok(expanded),
            };

            let after_start = start + OPENING.len();
            let end =
            match expanded[after_start..].find(')')
            {
                Some(end) => after_start + end,
                None => return Ok(expanded),
            };

            let label = expanded[after_start..end].trim().to_string();
            let dep =
            match BuildTarget::parse(&label, &ctx.node.target.cell, Some(&ctx.node.target.base_path))
            {
                Ok(dep) => dep,
                Err(_error) => return Err(ActionError::UnknownLocation
                {
                    target : ctx.node.target.clone(),
                    label : label,
                }),
            };

            let dep_rule =
            match ctx.dep_rules.get(&dep)
            {
                Some(dep_rule) => dep_rule,
                None => return Err(ActionError::UnknownLocation
                {
                    target : ctx.node.target.clone(),
                    label : label,
                }),
            };

            let replacement =
            match dep_rule.primary_output()
            {
                Some(output) => output.clone(),
                None => return Err(ActionError::UnknownLocation
                {
                    target : ctx.node.target.clone(),
                    label : label,
                }),
            };

            expanded = format!("{}{}{}", &expanded[..start], replacement, &expanded[end+1..]);
        }
    }
}

impl Description for GenruleDescription
{
    fn rule_type(&self) -> RuleType
    {
        RuleType{name : "genrule".to_string(), kind : RuleKind::Build}
    }

    fn schema(&self) -> Vec<AttrSpec>
    {
        vec![
            AttrSpec::required("cmd", AttrType::StrList),
            AttrSpec::required("out", AttrType::Str),
            AttrSpec::optional("srcs", AttrType::SourceList),
        ]
    }

    fn implicit_deps(
        &self,
        _target : &BuildTarget,
        attrs : &BTreeMap<String, CoercedAttr>,
        ctx : &CoerceContext) -> Result<Vec<BuildTarget>, CoerceError>
    {
        let mut deps = vec![];
        match attrs.get("cmd").and_then(|value| value.as_str_list())
        {
            Some(cmd) =>
            {
                for word in cmd
                {
                    for label in find_location_labels(word)
                    {
                        match BuildTarget::parse(&label, ctx.cell, Some(ctx.package))
                        {
                            Ok(target) => deps.push(target),
                            Err(error) => return Err(CoerceError::BadTarget("cmd".to_string(), error)),
                        }
                    }
                }
            },
            None => {},
        }
        Ok(deps)
    }

    fn create_rule(&self, ctx : &RuleContext) -> Result<BuildRule, ActionError>
    {
        let node = ctx.node;
        let out = required_str(node, "out")?;
        let cmd =
        match node.attr("cmd").and_then(|value| value.as_str_list())
        {
            Some(cmd) => cmd.clone(),
            None => return Err(ActionError::MissingAttribute
            {
                target : node.target.clone(),
                attribute : "cmd".to_string(),
            }),
        };

        let empty = vec![];
        let sources =
        match node.attr("srcs").and_then(|value| value.as_sources())
        {
            Some(sources) => sources,
            None => &empty,
        };

        let gen_dir = ctx.paths.gen_dir(&node.target);
        let out_path = format!("{}/{}", gen_dir, out);

        let (all_source_paths, mut file_inputs) = resolve_source_paths(ctx, sources)?;

        let mut argv = vec![];
        for word in &cmd
        {
            if word == "$SRCS"
            {
                for path in &all_source_paths
                {
                    argv.push(path.clone());
                }
            }
            else
            {
                argv.push(GenruleDescription::expand_in_string(word, &out_path, ctx)?);
            }
        }

        file_inputs.sort();
        file_inputs.dedup();

        let build_deps = node.parse_time_deps();

        Ok(BuildRule
        {
            target : node.target.clone(),
            rule_type : self.rule_type(),
            key_fields : vec![
                ("cmd".to_string(), KeyField::StrList(cmd)),
                ("deps".to_string(), KeyField::Deps(build_deps.clone())),
                ("out".to_string(), KeyField::Str(out.to_string())),
                ("runtime_deps".to_string(), KeyField::RuntimeDeps(node.runtime_deps.clone())),
                ("srcs".to_string(), KeyField::InputPaths(file_inputs.clone())),
            ],
            build_deps : build_deps,
            runtime_deps : node.runtime_deps.clone(),
            inputs : file_inputs,
            outputs : vec![out_path],
            steps : vec![
                Step::MakeDirs(gen_dir),
                Step::Run(argv),
            ],
            dep_file_inputs : None,
            supports_input_key : true,
        })
    }
}

/*  write_file: fixed content to one output file, no subprocess. */
pub struct WriteFileDescription
{
}

impl Description for WriteFileDescription
{
    fn rule_type(&self) -> RuleType
    {
        RuleType{name : "write_file".to_string(), kind : RuleKind::Build}
    }

    fn schema(&self) -> Vec<AttrSpec>
    {
        vec![
            AttrSpec::required("content", AttrType::Str),
            AttrSpec::required("out", AttrType::Str),
        ]
    }

    fn create_rule(&self, ctx : &RuleContext) -> Result<BuildRule, ActionError>
    {
        let node = ctx.node;
        let content = required_str(node, "content")?;
        let out = required_str(node, "out")?;

        let gen_dir = ctx.paths.gen_dir(&node.target);
        let out_path = format!("{}/{}", gen_dir, out);
        let build_deps = node.parse_time_deps();

        Ok(BuildRule
        {
            target : node.target.clone(),
            rule_type : self.rule_type(),
            key_fields : vec![
                ("content".to_string(), KeyField::Str(content.to_string())),
                ("deps".to_string(), KeyField::Deps(build_deps.clone())),
                ("out".to_string(), KeyField::Str(out.to_string())),
                ("runtime_deps".to_string(), KeyField::RuntimeDeps(node.runtime_deps.clone())),
            ],
            build_deps : build_deps,
            runtime_deps : node.runtime_deps.clone(),
            inputs : vec![],
            outputs : vec![out_path.clone()],
            steps : vec![
                Step::MakeDirs(gen_dir),
                Step::WriteFile
                {
                    path : out_path,
                    content : content.to_string(),
                },
            ],
            dep_file_inputs : None,
            supports_input_key : true,
        })
    }
}

/*  filegroup: collects sources into the gen tree unchanged. */
pub struct FilegroupDescription
{
}

impl Description for FilegroupDescription
{
    fn rule_type(&self) -> RuleType
    {
        RuleType{name : "filegroup".to_string(), kind : RuleKind::Build}
    }

    fn schema(&self) -> Vec<AttrSpec>
    {
        vec![
            AttrSpec::required("srcs", AttrType::SourceList),
        ]
    }

    fn create_rule(&self, ctx : &RuleContext) -> Result<BuildRule, ActionError>
    {
        let node = ctx.node;
        let sources =
        match node.attr("srcs").and_then(|value| value.as_sources())
        {
            Some(sources) => sources,
            None => return Err(ActionError::MissingAttribute
            {
                target : node.target.clone(),
                attribute : "srcs".to_string(),
            }),
        };

        let gen_dir = ctx.paths.gen_dir(&node.target);
        let (all_source_paths, mut file_inputs) = resolve_source_paths(ctx, sources)?;

        let mut steps = vec![Step::MakeDirs(gen_dir.clone())];
        let mut outputs = vec![];
        for path in &all_source_paths
        {
            let destination = format!("{}/{}", gen_dir, file_name_of(path));
            steps.push(Step::Copy
            {
                from : path.clone(),
                to : destination.clone(),
            });
            outputs.push(destination);
        }

        file_inputs.sort();
        file_inputs.dedup();

        let build_deps = node.parse_time_deps();

        Ok(BuildRule
        {
            target : node.target.clone(),
            rule_type : self.rule_type(),
            key_fields : vec![
                ("deps".to_string(), KeyField::Deps(build_deps.clone())),
                ("runtime_deps".to_string(), KeyField::RuntimeDeps(node.runtime_deps.clone())),
                ("srcs".to_string(), KeyField::InputPaths(file_inputs.clone())),
            ],
            build_deps : build_deps,
            runtime_deps : node.runtime_deps.clone(),
            inputs : file_inputs,
            outputs : outputs,
            steps : steps,
            dep_file_inputs : None,
            supports_input_key : true,
        })
    }
}

/*  alias: another name for an existing target; no work of its own. */
pub struct AliasDescription
{
}

impl Description for AliasDescription
{
    fn rule_type(&self) -> RuleType
    {
        RuleType{name : "alias".to_string(), kind : RuleKind::Build}
    }

    fn schema(&self) -> Vec<AttrSpec>
    {
        vec![
            AttrSpec::required("actual", AttrType::Dep),
        ]
    }

    fn create_rule(&self, ctx : &RuleContext) -> Result<BuildRule, ActionError>
    {
        let node = ctx.node;
        let actual =
        match node.attr("actual").and_then(|value| value.as_dep())
        {
            Some(actual) => actual.clone(),
            None => return Err(ActionError::MissingAttribute
            {
                target : node.target.clone(),
                attribute : "actual".to_string(),
            }),
        };

        let actual_rule = ctx.dep_rule(&actual)?;
        let build_deps = node.parse_time_deps();

        Ok(BuildRule
        {
            target : node.target.clone(),
            rule_type : self.rule_type(),
            key_fields : vec![
                ("actual".to_string(), KeyField::Dep(actual)),
            ],
            build_deps : build_deps,
            runtime_deps : node.runtime_deps.clone(),
            inputs : vec![],
            outputs : actual_rule.outputs.clone(),
            steps : vec![],
            dep_file_inputs : None,
            supports_input_key : true,
        })
    }
}

/*  config_setting: a named constraint set.  Configuration targets are
    never built below a build node; they exist so tooling can name
    conditions. */
pub struct ConfigSettingDescription
{
}

impl Description for ConfigSettingDescription
{
    fn rule_type(&self) -> RuleType
    {
        RuleType{name : "config_setting".to_string(), kind : RuleKind::Configuration}
    }

    fn schema(&self) -> Vec<AttrSpec>
    {
        vec![
            AttrSpec::required("values", AttrType::StrList),
        ]
    }

    fn create_rule(&self, ctx : &RuleContext) -> Result<BuildRule, ActionError>
    {
        let node = ctx.node;
        let values =
        match node.attr("values").and_then(|value| value.as_str_list())
        {
            Some(values) => values.clone(),
            None => return Err(ActionError::MissingAttribute
            {
                target : node.target.clone(),
                attribute : "values".to_string(),
            }),
        };

        Ok(BuildRule
        {
            target : node.target.clone(),
            rule_type : self.rule_type(),
            key_fields : vec![
                ("values".to_string(), KeyField::StrList(values)),
            ],
            build_deps : vec![],
            runtime_deps : vec![],
            inputs : vec![],
            outputs : vec![],
            steps : vec![],
            dep_file_inputs : None,
            supports_input_key : false,
        })
    }
}
