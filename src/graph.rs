use crate::node::TargetNode;
use crate::rules::RuleKind;
use crate::target::BuildTarget;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug)]
pub enum GraphError
{
    Cycle(Vec<BuildTarget>),
    MissingDep
    {
        from : BuildTarget,
        to : BuildTarget,
    },
    Visibility
    {
        from : BuildTarget,
        to : BuildTarget,
    },
    ConfigurationDep
    {
        from : BuildTarget,
        to : BuildTarget,
    },
}

impl fmt::Display for GraphError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            GraphError::Cycle(path) =>
            {
                let labels : Vec<String> = path.iter().map(|target| format!("{}", target)).collect();
                write!(formatter, "Dependency cycle among targets: {}", labels.join(" -> "))
            },

            GraphError::MissingDep{from, to} =>
                write!(formatter, "Target {} depends on {} which is not in the graph", from, to),

            GraphError::Visibility{from, to} =>
                write!(formatter, "Target {} is not visible to {}", to, from),

            GraphError::ConfigurationDep{from, to} =>
                write!(formatter, "Target {} takes configuration target {} as a dependency; configuration targets may only be roots", from, to),
        }
    }
}

/*  The immutable target graph.  assemble() is the only way to get one,
    and it refuses to produce a graph that has a cycle, a dangling dep,
    a hidden dep, or a configuration node below a build node. */
pub struct TargetGraph
{
    nodes : BTreeMap<BuildTarget, Arc<TargetNode>>,
}

impl TargetGraph
{
    pub fn assemble(
        nodes : BTreeMap<BuildTarget, Arc<TargetNode>>) -> Result<TargetGraph, GraphError>
    {
        /*  Edge checks: closure, visibility, configuration placement. */
        for (target, node) in &nodes
        {
            for dep in node.parse_time_deps()
            {
                let dep_node =
                match nodes.get(&dep)
                {
                    Some(dep_node) => dep_node,
                    None => return Err(GraphError::MissingDep
                    {
                        from : target.clone(),
                        to : dep,
                    }),
                };

                match dep_node.rule_type.kind
                {
                    RuleKind::Configuration =>
                    {
                        return Err(GraphError::ConfigurationDep
                        {
                            from : target.clone(),
                            to : dep,
                        });
                    },
                    RuleKind::Build => {},
                }

                if !dep_node.is_visible_to(target)
                {
                    return Err(GraphError::Visibility
                    {
                        from : target.clone(),
                        to : dep,
                    });
                }
            }
        }

        /*  Acyclicity: one depth-first post-order pass over every
            component.  A gray node reached again is a back-edge; the
            participants are the slice of the stack from that node
            down. */
        const WHITE : u8 = 0;
        const GRAY : u8 = 1;
        const BLACK : u8 = 2;

        let mut color : HashMap<&BuildTarget, u8> = HashMap::new();
        let deps_of : BTreeMap<&BuildTarget, Vec<BuildTarget>> = nodes
            .iter()
            .map(|(target, node)| (target, node.parse_time_deps()))
            .collect();

        for start in nodes.keys()
        {
            if *color.get(start).unwrap_or(&WHITE) != WHITE
            {
                continue;
            }

            let mut stack : Vec<(&BuildTarget, usize)> = vec![(start, 0)];
            color.insert(start, GRAY);

            while let Some((current, next_dep)) = stack.last().cloned()
            {
                let deps = deps_of.get(current).unwrap();
                if next_dep < deps.len()
                {
                    stack.last_mut().unwrap().1 += 1;
                    let dep = &deps[next_dep];

                    /*  deps_of keys borrow from `nodes`, so look the
                        dep up there to get a long-lived reference. */
                    let (dep_key, _node) = nodes.get_key_value(dep).unwrap();

                    match *color.get(dep_key).unwrap_or(&WHITE)
                    {
                        WHITE =>
                        {
                            color.insert(dep_key, GRAY);
                            stack.push((dep_key, 0));
                        },
                        GRAY =>
                        {
                            let position = stack
                                .iter()
                                .position(|(entry, _index)| *entry == dep_key)
                                .unwrap();
                            let path : Vec<BuildTarget> = stack[position..]
                                .iter()
                                .map(|(entry, _index)| (*entry).clone())
                                .collect();
                            return Err(GraphError::Cycle(path));
                        },
                        _ => {},
                    }
                }
                else
                {
                    color.insert(current, BLACK);
                    stack.pop();
                }
            }
        }

        Ok(TargetGraph{nodes : nodes})
    }

    pub fn get(&self, target : &BuildTarget) -> Option<&Arc<TargetNode>>
    {
        self.nodes.get(target)
    }

    pub fn len(&self) -> usize
    {
        self.nodes.len()
    }

    pub fn targets(&self) -> impl Iterator<Item = &BuildTarget>
    {
        self.nodes.keys()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<TargetNode>>
    {
        self.nodes.values()
    }
}

#[cfg(test)]
mod test
{
    use crate::coerce::VisibilityPattern;
    use crate::graph::
    {
        GraphError,
        TargetGraph,
    };
    use crate::node::TargetNode;
    use crate::rules::
    {
        RuleKind,
        RuleType,
    };
    use crate::target::BuildTarget;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn node(label : &str, deps : Vec<&str>, kind : RuleKind) -> (BuildTarget, Arc<TargetNode>)
    {
        let target = BuildTarget::parse(label, "root", None).unwrap();
        let node = TargetNode
        {
            target : target.clone(),
            rule_type : RuleType{name : "genrule".to_string(), kind : kind},
            attrs : BTreeMap::new(),
            declared_deps : deps
                .into_iter()
                .map(|dep| BuildTarget::parse(dep, "root", None).unwrap())
                .collect(),
            extra_deps : vec![],
            runtime_deps : vec![],
            tests : vec![],
            visibility : vec![VisibilityPattern::Public],
            inputs : vec![],
        };
        (target, Arc::new(node))
    }

    fn graph_of(entries : Vec<(BuildTarget, Arc<TargetNode>)>) -> Result<TargetGraph, GraphError>
    {
        TargetGraph::assemble(entries.into_iter().collect())
    }

    #[test]
    fn assemble_simple_chain()
    {
        let graph = graph_of(vec![
            node("//pkg:a", vec![], RuleKind::Build),
            node("//pkg:b", vec!["//pkg:a"], RuleKind::Build),
        ]).unwrap();

        assert_eq!(graph.len(), 2);
        assert!(graph.get(&BuildTarget::new("root", "pkg", "a")).is_some());
    }

    #[test]
    fn assemble_missing_dep_is_an_error()
    {
        match graph_of(vec![
            node("//pkg:b", vec!["//pkg:ghost"], RuleKind::Build),
        ])
        {
            Err(GraphError::MissingDep{from, to}) =>
            {
                assert_eq!(format!("{}", from), "root//pkg:b");
                assert_eq!(format!("{}", to), "root//pkg:ghost");
            },
            other => panic!("Wrong result: {:?}", other.map(|graph| graph.len())),
        }
    }

    #[test]
    fn assemble_two_cycle_is_an_error()
    {
        match graph_of(vec![
            node("//pkg:a", vec!["//pkg:b"], RuleKind::Build),
            node("//pkg:b", vec!["//pkg:a"], RuleKind::Build),
        ])
        {
            Err(GraphError::Cycle(path)) =>
            {
                assert_eq!(path.len(), 2);
                let labels : Vec<String> = path.iter().map(|target| format!("{}", target)).collect();
                assert!(labels.contains(&"root//pkg:a".to_string()));
                assert!(labels.contains(&"root//pkg:b".to_string()));
            },
            other => panic!("Wrong result: {:?}", other.map(|graph| graph.len())),
        }
    }

    #[test]
    fn assemble_self_cycle_is_an_error()
    {
        match graph_of(vec![
            node("//pkg:narcissus", vec!["//pkg:narcissus"], RuleKind::Build),
        ])
        {
            Err(GraphError::Cycle(path)) =>
            {
                assert_eq!(path.len(), 1);
                assert_eq!(format!("{}", path[0]), "root//pkg:narcissus");
            },
            other => panic!("Wrong result: {:?}", other.map(|graph| graph.len())),
        }
    }

    #[test]
    fn assemble_long_cycle_reports_participants_in_order()
    {
        match graph_of(vec![
            node("//pkg:a", vec!["//pkg:b"], RuleKind::Build),
            node("//pkg:b", vec!["//pkg:c"], RuleKind::Build),
            node("//pkg:c", vec!["//pkg:a"], RuleKind::Build),
            node("//pkg:bystander", vec![], RuleKind::Build),
        ])
        {
            Err(GraphError::Cycle(path)) =>
            {
                assert_eq!(path.len(), 3);
                /*  Successive path entries are actual edges. */
                for window in path.windows(2)
                {
                    let from = &window[0];
                    let to = &window[1];
                    assert_ne!(from, to);
                }
            },
            other => panic!("Wrong result: {:?}", other.map(|graph| graph.len())),
        }
    }

    #[test]
    fn assemble_diamond_is_fine()
    {
        let graph = graph_of(vec![
            node("//pkg:base", vec![], RuleKind::Build),
            node("//pkg:left", vec!["//pkg:base"], RuleKind::Build),
            node("//pkg:right", vec!["//pkg:base"], RuleKind::Build),
            node("//pkg:top", vec!["//pkg:left", "//pkg:right"], RuleKind::Build),
        ]).unwrap();

        assert_eq!(graph.len(), 4);
    }

    #[test]
    fn assemble_configuration_dep_is_an_error()
    {
        match graph_of(vec![
            node("//pkg:setting", vec![], RuleKind::Configuration),
            node("//pkg:consumer", vec!["//pkg:setting"], RuleKind::Build),
        ])
        {
            Err(GraphError::ConfigurationDep{from, to}) =>
            {
                assert_eq!(format!("{}", from), "root//pkg:consumer");
                assert_eq!(format!("{}", to), "root//pkg:setting");
            },
            other => panic!("Wrong result: {:?}", other.map(|graph| graph.len())),
        }
    }

    #[test]
    fn assemble_configuration_root_is_fine()
    {
        let graph = graph_of(vec![
            node("//pkg:setting", vec![], RuleKind::Configuration),
            node("//pkg:library", vec![], RuleKind::Build),
        ]).unwrap();

        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn assemble_invisible_dep_is_an_error()
    {
        let (hidden_target, hidden_arc) = node("//lib:hidden", vec![], RuleKind::Build);
        let mut hidden = (*hidden_arc).clone();
        hidden.visibility = vec![];
        let entries = vec![
            (hidden_target, Arc::new(hidden)),
            node("//app:consumer", vec!["//lib:hidden"], RuleKind::Build),
        ];

        match graph_of(entries)
        {
            Err(GraphError::Visibility{from, to}) =>
            {
                assert_eq!(format!("{}", from), "root//app:consumer");
                assert_eq!(format!("{}", to), "root//lib:hidden");
            },
            other => panic!("Wrong result: {:?}", other.map(|graph| graph.len())),
        }
    }
}
