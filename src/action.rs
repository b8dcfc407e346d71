use crate::cell::CellResolver;
use crate::graph::TargetGraph;
use crate::rules::
{
    Registry,
    RuleContext,
    RuleType,
};
use crate::target::BuildTarget;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::
{
    Arc,
    Condvar,
    Mutex,
};

/*  One side-effectful unit of a rule's recipe.  Steps are plain data;
    the engine interprets them against a System. */
#[derive(Debug, Clone, PartialEq)]
pub enum Step
{
    MakeDirs(String),
    WriteFile
    {
        path : String,
        content : String,
    },
    Copy
    {
        from : String,
        to : String,
    },
    Run(Vec<String>),
}

/*  A typed encoding of one declared rule field, in the stable order the
    rule-key factory consumes.  Input paths hash by content, output
    paths by name, dep references by the dep's own rule key. */
#[derive(Debug, Clone, PartialEq)]
pub enum KeyField
{
    Str(String),
    Int(i64),
    Bool(bool),
    StrList(Vec<String>),
    InputPath(String),
    InputPaths(Vec<String>),
    OutputPath(String),
    Dep(BuildTarget),
    Deps(Vec<BuildTarget>),
    RuntimeDeps(Vec<BuildTarget>),
}

/*  A unit of executable work, lowered from exactly one target node.
    Deps are recorded as target keys, never as owning references; the
    builder's index is the one place rules live. */
#[derive(Debug)]
pub struct BuildRule
{
    pub target : BuildTarget,
    pub rule_type : RuleType,
    pub build_deps : Vec<BuildTarget>,
    pub runtime_deps : Vec<BuildTarget>,

    /*  On-disk paths of source files read by the steps. */
    pub inputs : Vec<String>,

    /*  On-disk paths the steps promise to produce. */
    pub outputs : Vec<String>,

    pub steps : Vec<Step>,
    pub key_fields : Vec<(String, KeyField)>,

    /*  When a rule reports the subset of inputs it actually read, the
        factory can compute a narrowed dep-file key. */
    pub dep_file_inputs : Option<Vec<String>>,

    pub supports_input_key : bool,
}

impl BuildRule
{
    pub fn primary_output(&self) -> Option<&String>
    {
        self.outputs.first()
    }
}

#[derive(Debug)]
pub enum ActionError
{
    UnknownRuleType(String),
    MissingAttribute
    {
        target : BuildTarget,
        attribute : String,
    },
    UnknownCell(String),
    UnknownLocation
    {
        target : BuildTarget,
        label : String,
    },
    NodeNotInGraph(BuildTarget),
    ConstructionFailed
    {
        target : BuildTarget,
        message : String,
    },
}

impl fmt::Display for ActionError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            ActionError::UnknownRuleType(name) =>
                write!(formatter, "No rule description registered for type: {}", name),

            ActionError::MissingAttribute{target, attribute} =>
                write!(formatter, "Rule {} is missing attribute {} after coercion", target, attribute),

            ActionError::UnknownCell(name) =>
                write!(formatter, "Reference to unknown cell: {}", name),

            ActionError::UnknownLocation{target, label} =>
                write!(formatter, "Rule {} uses $(location {}) but does not depend on it", target, label),

            ActionError::NodeNotInGraph(target) =>
                write!(formatter, "Target missing from target graph: {}", target),

            ActionError::ConstructionFailed{target, message} =>
                write!(formatter, "Rule failed to construct for {}: {}", target, message),
        }
    }
}

/*  Where outputs live: a gen tree of final outputs, a scratch tree for
    transient work, a last tree of symlinks to the most recent build,
    and the local artifact cache. */
#[derive(Debug, Clone)]
pub struct OutputLayout
{
    pub out_root : String,
}

impl OutputLayout
{
    pub fn new(out_root : &str) -> OutputLayout
    {
        OutputLayout{out_root : out_root.to_string()}
    }

    pub fn gen_root(&self) -> String
    {
        format!("{}/gen", self.out_root)
    }

    pub fn scratch_root(&self) -> String
    {
        format!("{}/scratch", self.out_root)
    }

    pub fn last_root(&self) -> String
    {
        format!("{}/last", self.out_root)
    }

    pub fn cache_root(&self) -> String
    {
        format!("{}/cache", self.out_root)
    }

    fn target_dir(&self, root : String, target : &BuildTarget) -> String
    {
        let flavor_part =
        if target.flavors.len() == 0
        {
            "".to_string()
        }
        else
        {
            format!("{}__", target.flavors.join(","))
        };

        if target.base_path == ""
        {
            format!("{}/{}/{}__{}", root, target.cell, target.short_name, flavor_part)
        }
        else
        {
            format!("{}/{}/{}/{}__{}", root, target.cell, target.base_path, target.short_name, flavor_part)
        }
    }

    /*  The directory a target's final outputs land in, derived from the
        target deterministically. */
    pub fn gen_dir(&self, target : &BuildTarget) -> String
    {
        self.target_dir(self.gen_root(), target)
    }

    pub fn scratch_dir(&self, target : &BuildTarget) -> String
    {
        self.target_dir(self.scratch_root(), target)
    }

    pub fn last_dir(&self, target : &BuildTarget) -> String
    {
        self.target_dir(self.last_root(), target)
    }
}

/*  Maps logical source references to concrete on-disk paths. */
#[derive(Debug, Clone)]
pub struct SourcePathResolver
{
    pub cells : CellResolver,
    pub layout : OutputLayout,
}

impl SourcePathResolver
{
    pub fn source_file(&self, cell_name : &str, cell_relative : &str) -> Result<String, ActionError>
    {
        match self.cells.get(cell_name)
        {
            Ok(cell) => Ok(cell.source_path(cell_relative)),
            Err(_error) => Err(ActionError::UnknownCell(cell_name.to_string())),
        }
    }

    pub fn gen_dir(&self, target : &BuildTarget) -> String
    {
        self.layout.gen_dir(target)
    }
}

enum SlotState
{
    Building,
    Ready(Arc<BuildRule>),
    Failed(String),
}

type Slot = Arc<(Mutex<SlotState>, Condvar)>;

/*  Memoized lowering of target nodes into build rules.  At most one
    BuildRule is ever constructed per target within one builder
    lifetime; concurrent require_rule calls for the same target collapse
    onto the first caller's construction.

    Lock discipline: the index lock is only held to look up or insert a
    slot, never across rule construction, so re-entrant construction of
    dep rules cannot deadlock. */
pub struct ActionGraphBuilder
{
    graph : Arc<TargetGraph>,
    registry : Arc<Registry>,
    paths : Arc<SourcePathResolver>,
    index : Mutex<HashMap<BuildTarget, Slot>>,
}

impl ActionGraphBuilder
{
    pub fn new(
        graph : Arc<TargetGraph>,
        registry : Arc<Registry>,
        paths : Arc<SourcePathResolver>) -> ActionGraphBuilder
    {
        ActionGraphBuilder
        {
            graph : graph,
            registry : registry,
            paths : paths,
            index : Mutex::new(HashMap::new()),
        }
    }

    pub fn source_path_resolver(&self) -> &SourcePathResolver
    {
        &self.paths
    }

    pub fn graph(&self) -> &Arc<TargetGraph>
    {
        &self.graph
    }

    /*  Returns the rule for the target, constructing it (and its deps'
        rules, re-entrantly) the first time. */
    pub fn require_rule(&self, target : &BuildTarget) -> Result<Arc<BuildRule>, ActionError>
    {
        let slot =
        {
            let mut index = self.index.lock().unwrap();
            match index.get(target)
            {
                Some(slot) =>
                {
                    let slot = slot.clone();
                    drop(index);
                    return self.wait_for_slot(target, &slot);
                },
                None =>
                {
                    let slot : Slot = Arc::new((Mutex::new(SlotState::Building), Condvar::new()));
                    index.insert(target.clone(), slot.clone());
                    slot
                },
            }
        };

        match self.construct_rule(target)
        {
            Ok(rule) =>
            {
                let rule = Arc::new(rule);
                {
                    let (state, condvar) = &*slot;
                    *state.lock().unwrap() = SlotState::Ready(rule.clone());
                    condvar.notify_all();
                }
                Ok(rule)
            },
            Err(error) =>
            {
                {
                    let (state, condvar) = &*slot;
                    *state.lock().unwrap() = SlotState::Failed(format!("{}", error));
                    condvar.notify_all();
                }
                Err(error)
            },
        }
    }

    fn wait_for_slot(
        &self,
        target : &BuildTarget,
        slot : &Slot) -> Result<Arc<BuildRule>, ActionError>
    {
        let (state, condvar) = &**slot;
        let mut guard = state.lock().unwrap();
        loop
        {
            match &*guard
            {
                SlotState::Ready(rule) => return Ok(rule.clone()),
                SlotState::Failed(message) => return Err(ActionError::ConstructionFailed
                {
                    target : target.clone(),
                    message : message.clone(),
                }),
                SlotState::Building => {},
            }
            guard = condvar.wait(guard).unwrap();
        }
    }

    fn construct_rule(&self, target : &BuildTarget) -> Result<BuildRule, ActionError>
    {
        let node =
        match self.graph.get(target)
        {
            Some(node) => node.clone(),
            None => return Err(ActionError::NodeNotInGraph(target.clone())),
        };

        let description =
        match self.registry.get(&node.rule_type.name)
        {
            Some(description) => description,
            None => return Err(ActionError::UnknownRuleType(node.rule_type.name.clone())),
        };

        /*  Deps' rules first; construction is re-entrant and the target
            graph is already known to be acyclic. */
        let mut dep_rules : BTreeMap<BuildTarget, Arc<BuildRule>> = BTreeMap::new();
        for dep in node.parse_time_deps()
        {
            let dep_rule = self.require_rule(&dep)?;
            dep_rules.insert(dep, dep_rule);
        }

        description.create_rule(&RuleContext
        {
            node : &node,
            dep_rules : &dep_rules,
            paths : &self.paths,
        })
    }

    /*  Returns the rule only if it has already been constructed. */
    pub fn get_rule_optional(&self, target : &BuildTarget) -> Option<Arc<BuildRule>>
    {
        let index = self.index.lock().unwrap();
        match index.get(target)
        {
            Some(slot) =>
            {
                let (state, _condvar) = &**slot;
                match &*state.lock().unwrap()
                {
                    SlotState::Ready(rule) => Some(rule.clone()),
                    _ => None,
                }
            },
            None => None,
        }
    }

    /*  Registers an extra index entry, e.g. a flavored variant a
        constructor produced alongside its main rule.  An existing entry
        wins: the interning invariant is at most one rule per key. */
    pub fn add_to_index(&self, rule : Arc<BuildRule>)
    {
        let mut index = self.index.lock().unwrap();
        if !index.contains_key(&rule.target)
        {
            let slot : Slot = Arc::new((Mutex::new(SlotState::Ready(rule.clone())), Condvar::new()));
            index.insert(rule.target.clone(), slot);
        }
    }
}
