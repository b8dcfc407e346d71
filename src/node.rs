use crate::coerce::
{
    CoercedAttr,
    VisibilityPattern,
};
use crate::rules::RuleType;
use crate::target::BuildTarget;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

/*  A configured target: typed constructor arguments, the dependency
    edges the parser discovered, and the input files the rule reads.
    Nodes are created once per target per command and shared from then
    on. */
#[derive(Debug, Clone)]
pub struct TargetNode
{
    pub target : BuildTarget,
    pub rule_type : RuleType,
    pub attrs : BTreeMap<String, CoercedAttr>,

    /*  Deps named by the rule's attributes. */
    pub declared_deps : Vec<BuildTarget>,

    /*  Deps the rule description added on its own. */
    pub extra_deps : Vec<BuildTarget>,

    /*  Needed to run the output, not to build it. */
    pub runtime_deps : Vec<BuildTarget>,

    pub tests : Vec<BuildTarget>,
    pub visibility : Vec<VisibilityPattern>,

    /*  Cell-relative paths of the source files this target reads. */
    pub inputs : Vec<String>,
}

impl TargetNode
{
    pub fn attr(&self, name : &str) -> Option<&CoercedAttr>
    {
        self.attrs.get(name)
    }

    /*  The edges of the target graph: declared plus extra deps, in
        sorted order without duplicates.  Runtime deps and tests are
        metadata, not parse-time edges. */
    pub fn parse_time_deps(&self) -> Vec<BuildTarget>
    {
        let mut deps : BTreeSet<BuildTarget> = BTreeSet::new();
        for dep in self.declared_deps.iter().chain(self.extra_deps.iter())
        {
            deps.insert(dep.clone());
        }
        deps.into_iter().collect()
    }

    /*  Visibility: targets in the same package always see each other,
        otherwise at least one declared pattern must match. */
    pub fn is_visible_to(&self, dependent : &BuildTarget) -> bool
    {
        if dependent.cell == self.target.cell && dependent.base_path == self.target.base_path
        {
            return true;
        }

        for pattern in &self.visibility
        {
            if pattern.matches(dependent)
            {
                return true;
            }
        }

        false
    }
}
