use crate::evaluator::
{
    Evaluator,
    Manifest,
    ParseError,
    compute_glob,
};
use crate::graph::
{
    GraphError,
    TargetGraph,
};
use crate::node::TargetNode;
use crate::resolver::
{
    ResolveError,
    TargetResolver,
};
use crate::system::System;
use crate::target::
{
    BuildTarget,
    TargetPattern,
};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::fmt;
use std::sync::
{
    Arc,
    Mutex,
};
use std::sync::mpsc;
use std::sync::mpsc::
{
    Receiver,
    Sender,
};
use std::thread;

#[derive(Debug)]
pub enum AssembleError
{
    Resolve(ResolveError),
    Graph(GraphError),
    WorkerFailed,
}

impl fmt::Display for AssembleError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            AssembleError::Resolve(error) =>
                write!(formatter, "{}", error),

            AssembleError::Graph(error) =>
                write!(formatter, "{}", error),

            AssembleError::WorkerFailed =>
                write!(formatter, "A parser worker exited unexpectedly"),
        }
    }
}

pub struct AssembleResult
{
    pub graph : TargetGraph,
    pub roots : Vec<BuildTarget>,

    /*  The manifests this command parsed, keyed by (cell, package).
        A caller holding the process open can seed the next assembly
        with them; stale globs get them re-parsed. */
    pub manifests : HashMap<(String, String), Manifest>,
}

type PackageKey = (String, String);
type ParseResult = (PackageKey, Result<Manifest, ParseError>);

struct Coordinator<'a, SystemType : System>
{
    resolver : &'a TargetResolver<SystemType>,
    job_sender : Sender<PackageKey>,
    result_receiver : Receiver<ParseResult>,
    seed : HashMap<PackageKey, Manifest>,
    requested : HashSet<PackageKey>,
    manifests : HashMap<PackageKey, Manifest>,
    pending : usize,
}

impl<'a, SystemType : System> Coordinator<'a, SystemType>
{
    /*  Asks for a package's manifest.  A seeded manifest is reused
        only when every recorded glob still expands the same way;
        otherwise the package goes back to the workers for a fresh
        parse. */
    fn request(&mut self, package : PackageKey) -> Result<(), AssembleError>
    {
        if self.requested.contains(&package)
        {
            return Ok(());
        }
        self.requested.insert(package.clone());

        match self.seed.remove(&package)
        {
            Some(manifest) =>
            {
                let mut still_valid = true;
                for record in &manifest.globs
                {
                    match compute_glob(
                        &self.resolver.system,
                        &self.resolver.cells,
                        &package.0,
                        &package.1,
                        &record.include,
                        &record.exclude)
                    {
                        Ok(fresh) =>
                        {
                            if fresh != record.results
                            {
                                still_valid = false;
                                break;
                            }
                        },
                        Err(_error) =>
                        {
                            still_valid = false;
                            break;
                        },
                    }
                }

                if still_valid
                {
                    self.manifests.insert(package, manifest);
                    return Ok(());
                }
            },
            None => {},
        }

        match self.job_sender.send(package)
        {
            Ok(()) => {},
            Err(_error) => return Err(AssembleError::WorkerFailed),
        }
        self.pending += 1;
        Ok(())
    }

    fn receive_one(&mut self) -> Result<(), AssembleError>
    {
        match self.result_receiver.recv()
        {
            Ok((package, Ok(manifest))) =>
            {
                self.pending -= 1;
                self.manifests.insert(package, manifest);
                Ok(())
            },
            Ok((_package, Err(error))) =>
                Err(AssembleError::Resolve(ResolveError::Parse(error))),
            Err(_error) =>
                Err(AssembleError::WorkerFailed),
        }
    }

    fn drain(&mut self) -> Result<(), AssembleError>
    {
        while self.pending > 0
        {
            self.receive_one()?;
        }
        Ok(())
    }
}

/*  Builds the target graph for a set of patterns: discover and parse
    the relevant build files on a dedicated worker pool, walk the
    transitive parse-time deps, coerce every reached target, and hand
    the closed node set to TargetGraph::assemble for the acyclicity,
    visibility and configuration checks. */
pub fn assemble<SystemType : System + 'static>(
    resolver : &TargetResolver<SystemType>,
    patterns : &Vec<TargetPattern>,
    parser_threads : usize,
    seed : HashMap<PackageKey, Manifest>) -> Result<AssembleResult, AssembleError>
{
    let (job_sender, job_receiver) = mpsc::channel::<PackageKey>();
    let job_receiver = Arc::new(Mutex::new(job_receiver));
    let (result_sender, result_receiver) = mpsc::channel::<ParseResult>();

    let worker_count = if parser_threads == 0 { 1 } else { parser_threads };
    let mut workers = vec![];
    for _ in 0..worker_count
    {
        let jobs = job_receiver.clone();
        let results = result_sender.clone();
        let system = resolver.system.clone();
        let cells = resolver.cells.clone();
        let registry = resolver.registry.clone();

        workers.push(thread::spawn(
            move ||
            {
                let evaluator =
                match Evaluator::new(system, cells, registry)
                {
                    Ok(evaluator) => evaluator,
                    Err(error) =>
                    {
                        let _ = results.send((("".to_string(), "".to_string()), Err(error)));
                        return;
                    },
                };

                loop
                {
                    let job =
                    {
                        let guard = jobs.lock().unwrap();
                        guard.recv()
                    };

                    match job
                    {
                        Ok((cell, package)) =>
                        {
                            let result = evaluator.evaluate(&cell, &package);
                            match results.send(((cell, package), result))
                            {
                                Ok(()) => {},
                                Err(_error) => return,
                            }
                        },
                        Err(_error) => return,
                    }
                }
            }));
    }
    drop(result_sender);

    let mut coordinator = Coordinator
    {
        resolver : resolver,
        job_sender : job_sender,
        result_receiver : result_receiver,
        seed : seed,
        requested : HashSet::new(),
        manifests : HashMap::new(),
        pending : 0,
    };

    let outcome = run_assembly(resolver, patterns, &mut coordinator);

    /*  Closing the job channel sends the workers home. */
    drop(coordinator);
    for worker in workers
    {
        let _ = worker.join();
    }

    outcome
}

fn run_assembly<SystemType : System + 'static>(
    resolver : &TargetResolver<SystemType>,
    patterns : &Vec<TargetPattern>,
    coordinator : &mut Coordinator<SystemType>) -> Result<AssembleResult, AssembleError>
{
    /*  Parse every package the patterns name directly. */
    let mut pattern_packages = vec![];
    for pattern in patterns
    {
        let packages =
        match resolver.expand_pattern(pattern)
        {
            Ok(packages) => packages,
            Err(error) => return Err(AssembleError::Resolve(error)),
        };
        for package in &packages
        {
            coordinator.request(package.clone())?;
        }
        pattern_packages.push(packages);
    }
    coordinator.drain()?;

    /*  Pick the roots each pattern selects. */
    let mut roots = vec![];
    let mut seen_roots = HashSet::new();
    for (pattern, packages) in patterns.iter().zip(pattern_packages.iter())
    {
        let manifests : Vec<&Manifest> = packages
            .iter()
            .filter_map(|package| coordinator.manifests.get(package))
            .collect();

        let selected =
        match resolver.select_roots(pattern, &manifests)
        {
            Ok(selected) => selected,
            Err(error) => return Err(AssembleError::Resolve(error)),
        };

        for root in selected
        {
            if seen_roots.insert(root.clone())
            {
                roots.push(root);
            }
        }
    }

    /*  Transitive closure over parse-time deps.  Targets whose package
        has not been parsed yet wait until its manifest arrives. */
    let mut nodes : BTreeMap<BuildTarget, Arc<TargetNode>> = BTreeMap::new();
    let mut seen : HashSet<BuildTarget> = roots.iter().cloned().collect();
    let mut queue : VecDeque<BuildTarget> = roots.iter().cloned().collect();
    let mut waiting : HashMap<PackageKey, Vec<BuildTarget>> = HashMap::new();

    loop
    {
        while let Some(target) = queue.pop_front()
        {
            let package_key = (target.cell.clone(), target.base_path.clone());
            match coordinator.manifests.get(&package_key)
            {
                Some(manifest) =>
                {
                    let raw =
                    match manifest.targets.get(&target.short_name)
                    {
                        Some(raw) => raw,
                        None => return Err(AssembleError::Resolve(
                            ResolveError::UnknownTarget(target))),
                    };

                    let mut node =
                    match resolver.resolve_node(raw, &target.cell, &target.base_path)
                    {
                        Ok(node) => node,
                        Err(error) => return Err(AssembleError::Resolve(error)),
                    };

                    /*  A flavored dep is a specialization of the same
                        declaration; it keeps its own key. */
                    node.target = target.clone();

                    for dep in node.parse_time_deps()
                    {
                        if seen.insert(dep.clone())
                        {
                            queue.push_back(dep);
                        }
                    }

                    nodes.insert(target, Arc::new(node));
                },
                None =>
                {
                    coordinator.request(package_key.clone())?;
                    waiting.entry(package_key).or_insert_with(Vec::new).push(target);
                },
            }
        }

        if coordinator.pending == 0
        {
            if !waiting.is_empty()
            {
                /*  Requests satisfied by the seed never produce a
                    receive, so release whatever became available. */
                let ready : Vec<PackageKey> = waiting
                    .keys()
                    .filter(|key| coordinator.manifests.contains_key(*key))
                    .cloned()
                    .collect();

                if ready.is_empty()
                {
                    return Err(AssembleError::WorkerFailed);
                }

                for key in ready
                {
                    for target in waiting.remove(&key).unwrap_or_default()
                    {
                        queue.push_back(target);
                    }
                }
                continue;
            }
            break;
        }

        coordinator.receive_one()?;

        let ready : Vec<PackageKey> = waiting
            .keys()
            .filter(|key| coordinator.manifests.contains_key(*key))
            .cloned()
            .collect();
        for key in ready
        {
            for target in waiting.remove(&key).unwrap_or_default()
            {
                queue.push_back(target);
            }
        }
    }

    let graph =
    match TargetGraph::assemble(nodes)
    {
        Ok(graph) => graph,
        Err(error) => return Err(AssembleError::Graph(error)),
    };

    Ok(AssembleResult
    {
        graph : graph,
        roots : roots,
        manifests : std::mem::take(&mut coordinator.manifests),
    })
}

#[cfg(test)]
mod test
{
    use crate::system::System;
    use crate::assembler::
    {
        AssembleError,
        assemble,
    };
    use crate::cell::CellResolver;
    use crate::config::Platform;
    use crate::graph::GraphError;
    use crate::resolver::
    {
        ResolveError,
        TargetResolver,
    };
    use crate::rules::Registry;
    use crate::system::fake::FakeSystem;
    use crate::system::util::write_str_to_file;
    use crate::target::
    {
        BuildTarget,
        TargetPattern,
    };
    use std::collections::HashMap;
    use std::sync::Arc;

    fn resolver_for(system : &FakeSystem) -> TargetResolver<FakeSystem>
    {
        let cells = CellResolver::load(system, &vec![]).unwrap();
        let platform = Platform::from_config(&cells.root_cell().config);
        TargetResolver
        {
            system : system.clone(),
            cells : cells,
            platform : platform,
            registry : Arc::new(Registry::with_builtins()),
        }
    }

    fn patterns(resolver : &TargetResolver<FakeSystem>, texts : Vec<&str>) -> Vec<TargetPattern>
    {
        resolver.parse_patterns(
            &texts.into_iter().map(|text| text.to_string()).collect()).unwrap()
    }

    #[test]
    fn assemble_follows_deps_across_packages()
    {
        let mut system = FakeSystem::new(10);
        write_str_to_file(&mut system, "lib/BUILD", "\
write_file {
    name = \"base\",
    content = \"foundation\",
    out = \"base.txt\",
    visibility = {\"PUBLIC\"},
}
").unwrap();
        write_str_to_file(&mut system, "app/BUILD", "\
genrule {
    name = \"top\",
    srcs = {\"//lib:base\"},
    cmd = {\"concat\", \"$SRCS\", \"$OUT\"},
    out = \"top.txt\",
}
").unwrap();

        let resolver = resolver_for(&system);
        let result = assemble(
            &resolver,
            &patterns(&resolver, vec!["//app:top"]),
            2,
            HashMap::new()).unwrap();

        assert_eq!(result.roots, vec![BuildTarget::new("root", "app", "top")]);
        assert_eq!(result.graph.len(), 2);
        assert!(result.graph.get(&BuildTarget::new("root", "lib", "base")).is_some());
    }

    #[test]
    fn assemble_cycle_across_packages_is_an_error()
    {
        let mut system = FakeSystem::new(10);
        write_str_to_file(&mut system, "one/BUILD", "\
genrule {
    name = \"a\",
    srcs = {\"//two:b\"},
    cmd = {\"concat\", \"$SRCS\", \"$OUT\"},
    out = \"a.txt\",
    visibility = {\"PUBLIC\"},
}
").unwrap();
        write_str_to_file(&mut system, "two/BUILD", "\
genrule {
    name = \"b\",
    srcs = {\"//one:a\"},
    cmd = {\"concat\", \"$SRCS\", \"$OUT\"},
    out = \"b.txt\",
    visibility = {\"PUBLIC\"},
}
").unwrap();

        let resolver = resolver_for(&system);
        match assemble(
            &resolver,
            &patterns(&resolver, vec!["//one:a"]),
            2,
            HashMap::new())
        {
            Err(AssembleError::Graph(GraphError::Cycle(path))) =>
            {
                let labels : Vec<String> = path.iter().map(|target| format!("{}", target)).collect();
                assert!(labels.contains(&"root//one:a".to_string()));
                assert!(labels.contains(&"root//two:b".to_string()));
            },
            other => panic!("Wrong result: {:?}", other.map(|result| result.graph.len())),
        }
    }

    #[test]
    fn assemble_missing_dep_target_is_an_error()
    {
        let mut system = FakeSystem::new(10);
        write_str_to_file(&mut system, "app/BUILD", "\
genrule {
    name = \"top\",
    srcs = {\":ghost\"},
    cmd = {\"concat\", \"$SRCS\", \"$OUT\"},
    out = \"top.txt\",
}
").unwrap();

        let resolver = resolver_for(&system);
        match assemble(
            &resolver,
            &patterns(&resolver, vec!["//app:top"]),
            2,
            HashMap::new())
        {
            Err(AssembleError::Resolve(ResolveError::UnknownTarget(target))) =>
                assert_eq!(format!("{}", target), "root//app:ghost"),
            other => panic!("Wrong result: {:?}", other.map(|result| result.graph.len())),
        }
    }

    #[test]
    fn assemble_parse_error_in_dep_package_fails_the_command()
    {
        let mut system = FakeSystem::new(10);
        write_str_to_file(&mut system, "app/BUILD", "\
genrule {
    name = \"top\",
    srcs = {\"//broken:dep\"},
    cmd = {\"concat\", \"$SRCS\", \"$OUT\"},
    out = \"top.txt\",
}
").unwrap();
        write_str_to_file(&mut system, "broken/BUILD", "this is not lua {{{{\n").unwrap();

        let resolver = resolver_for(&system);
        match assemble(
            &resolver,
            &patterns(&resolver, vec!["//app:top"]),
            2,
            HashMap::new())
        {
            Err(AssembleError::Resolve(ResolveError::Parse(_error))) => {},
            other => panic!("Wrong result: {:?}", other.map(|result| result.graph.len())),
        }
    }

    #[test]
    fn assemble_recursive_pattern_collects_every_package()
    {
        let mut system = FakeSystem::new(10);
        for index in 0..12
        {
            write_str_to_file(
                &mut system,
                &format!("tree/pkg{}/BUILD", index),
                &format!("\
write_file {{
    name = \"leaf\",
    content = \"{}\",
    out = \"leaf.txt\",
}}
", index)).unwrap();
        }

        let resolver = resolver_for(&system);
        let result = assemble(
            &resolver,
            &patterns(&resolver, vec!["//tree/..."]),
            4,
            HashMap::new()).unwrap();

        assert_eq!(result.roots.len(), 12);
        assert_eq!(result.graph.len(), 12);
        assert_eq!(result.manifests.len(), 12);
    }

    #[test]
    fn assemble_visibility_violation_is_an_error()
    {
        let mut system = FakeSystem::new(10);
        write_str_to_file(&mut system, "lib/BUILD", "\
write_file {
    name = \"secret\",
    content = \"classified\",
    out = \"secret.txt\",
}
").unwrap();
        write_str_to_file(&mut system, "app/BUILD", "\
genrule {
    name = \"snoop\",
    srcs = {\"//lib:secret\"},
    cmd = {\"concat\", \"$SRCS\", \"$OUT\"},
    out = \"snoop.txt\",
}
").unwrap();

        let resolver = resolver_for(&system);
        match assemble(
            &resolver,
            &patterns(&resolver, vec!["//app:snoop"]),
            2,
            HashMap::new())
        {
            Err(AssembleError::Graph(GraphError::Visibility{from, to})) =>
            {
                assert_eq!(format!("{}", from), "root//app:snoop");
                assert_eq!(format!("{}", to), "root//lib:secret");
            },
            other => panic!("Wrong result: {:?}", other.map(|result| result.graph.len())),
        }
    }

    #[test]
    fn assemble_reuses_seeded_manifest_while_globs_hold()
    {
        let mut system = FakeSystem::new(10);
        write_str_to_file(&mut system, "pkg/a.c", "").unwrap();
        write_str_to_file(&mut system, "pkg/b.c", "").unwrap();
        write_str_to_file(&mut system, "pkg/BUILD", "\
genrule {
    name = \"lib\",
    srcs = glob{\"*.c\"},
    cmd = {\"concat\", \"$SRCS\", \"$OUT\"},
    out = \"lib.a\",
}
").unwrap();

        let resolver = resolver_for(&system);
        let first = assemble(
            &resolver,
            &patterns(&resolver, vec!["//pkg:lib"]),
            2,
            HashMap::new()).unwrap();

        /*  Doctor the seeded manifest so we can tell whether it was
            reused or re-parsed. */
        let mut seed = first.manifests.clone();
        let key = ("root".to_string(), "pkg".to_string());
        let mut doctored = seed.get(&key).unwrap().clone();
        let mut lib = doctored.targets.get("lib").unwrap().clone();
        lib.attrs.insert(
            "out".to_string(),
            crate::attr::RawValue::Str("doctored.a".to_string()));
        doctored.targets.insert("lib".to_string(), lib);
        seed.insert(key.clone(), doctored);

        /*  Globs unchanged: the doctored manifest is trusted. */
        let reused = assemble(
            &resolver,
            &patterns(&resolver, vec!["//pkg:lib"]),
            2,
            seed.clone()).unwrap();
        let node = reused.graph.get(&BuildTarget::new("root", "pkg", "lib")).unwrap();
        assert_eq!(node.attr("out").unwrap().as_str(), Some("doctored.a"));

        /*  Removing a globbed file invalidates the record: the package
            re-parses from disk and the doctored manifest is dropped. */
        system.remove_file("pkg/b.c").unwrap();
        let reparsed = assemble(
            &resolver,
            &patterns(&resolver, vec!["//pkg:lib"]),
            2,
            seed).unwrap();
        let node = reparsed.graph.get(&BuildTarget::new("root", "pkg", "lib")).unwrap();
        assert_eq!(node.attr("out").unwrap().as_str(), Some("lib.a"));
        assert_eq!(node.inputs, vec!["pkg/a.c".to_string()]);
    }
}
