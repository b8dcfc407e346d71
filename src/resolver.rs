use crate::attr::RawTargetNode;
use crate::cell::
{
    CellError,
    CellResolver,
};
use crate::coerce::
{
    AttrType,
    CoerceContext,
    CoerceError,
    CoercedAttr,
    SourceRef,
    VisibilityPattern,
    coerce,
    resolve_selects,
};
use crate::config::Platform;
use crate::evaluator::
{
    Manifest,
    ParseError,
};
use crate::node::TargetNode;
use crate::rules::Registry;
use crate::system::System;
use crate::target::
{
    BuildTarget,
    TargetParseError,
    TargetPattern,
};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

#[derive(Debug)]
pub enum ResolveError
{
    Parse(ParseError),
    Coerce(BuildTarget, CoerceError),
    Cell(CellError),
    BadPattern(String, TargetParseError),
    UnknownTarget(BuildTarget),
    UnknownRuleType(BuildTarget, String),
    PackageBoundary
    {
        target : BuildTarget,
        input : String,
        owning_package : String,
    },
}

impl fmt::Display for ResolveError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            ResolveError::Parse(error) =>
                write!(formatter, "{}", error),

            ResolveError::Coerce(target, error) =>
                write!(formatter, "{}: {}", target, error),

            ResolveError::Cell(error) =>
                write!(formatter, "{}", error),

            ResolveError::BadPattern(text, error) =>
                write!(formatter, "Malformed target pattern {}: {}", text, error),

            ResolveError::UnknownTarget(target) =>
                write!(formatter, "No rule found for target: {}", target),

            ResolveError::UnknownRuleType(target, name) =>
                write!(formatter, "{} declared with unknown rule type: {}", target, name),

            ResolveError::PackageBoundary{target, input, owning_package} =>
                write!(
                    formatter,
                    "Input file {} of target {} belongs to package {}, which owns it",
                    input, target, owning_package),
        }
    }
}

/*  Turns raw manifests into typed target nodes, and target patterns
    into lists of packages to parse. */
pub struct TargetResolver<SystemType : System>
{
    pub system : SystemType,
    pub cells : CellResolver,
    pub platform : Platform,
    pub registry : Arc<Registry>,
}

impl<SystemType : System> TargetResolver<SystemType>
{
    /*  The packages a pattern names.  A recursive pattern walks the
        subtree and keeps every directory that has a build file. */
    pub fn expand_pattern(
        &self,
        pattern : &TargetPattern) -> Result<Vec<(String, String)>, ResolveError>
    {
        match pattern
        {
            TargetPattern::Single(target) =>
                Ok(vec![(target.cell.clone(), target.base_path.clone())]),

            TargetPattern::Package{cell, base_path} =>
                Ok(vec![(cell.clone(), base_path.clone())]),

            TargetPattern::Recursive{cell, base_path} =>
            {
                let cell_obj =
                match self.cells.get(cell)
                {
                    Ok(cell_obj) => cell_obj,
                    Err(error) => return Err(ResolveError::Cell(error)),
                };

                let build_file_name = cell_obj.build_file_name.clone();
                let mut packages = vec![];
                let mut pending = vec![(cell_obj.package_dir(base_path), base_path.clone())];

                while let Some((dir, package)) = pending.pop()
                {
                    let listing_path = if dir == "" { ".".to_string() } else { dir.clone() };

                    if self.system.is_file(&format!(
                        "{}{}{}",
                        dir,
                        if dir == "" { "" } else { "/" },
                        build_file_name))
                    {
                        packages.push((cell.clone(), package.clone()));
                    }

                    let children =
                    match self.system.list_dir(&listing_path)
                    {
                        Ok(children) => children,
                        Err(_error) => continue,
                    };

                    for child in children
                    {
                        if self.system.is_dir(&child)
                        {
                            let name =
                            match child.rfind('/')
                            {
                                Some(index) => child[index+1..].to_string(),
                                None => child.clone(),
                            };

                            let child_package =
                            if package == ""
                            {
                                name
                            }
                            else
                            {
                                format!("{}/{}", package, name)
                            };
                            pending.push((child, child_package));
                        }
                    }
                }

                packages.sort();
                Ok(packages)
            },
        }
    }

    /*  The root targets a pattern selects out of the parsed manifests.
        Package and recursive patterns take every target declared in
        their packages. */
    pub fn select_roots(
        &self,
        pattern : &TargetPattern,
        manifests : &Vec<&Manifest>) -> Result<Vec<BuildTarget>, ResolveError>
    {
        match pattern
        {
            TargetPattern::Single(target) =>
            {
                for manifest in manifests
                {
                    if manifest.cell == target.cell && manifest.package == target.base_path
                    {
                        if manifest.targets.contains_key(&target.short_name)
                        {
                            return Ok(vec![target.clone()]);
                        }
                    }
                }
                Err(ResolveError::UnknownTarget(target.clone()))
            },

            TargetPattern::Package{..} | TargetPattern::Recursive{..} =>
            {
                let mut roots = BTreeSet::new();
                for manifest in manifests
                {
                    for name in manifest.targets.keys()
                    {
                        roots.insert(BuildTarget::new(&manifest.cell, &manifest.package, name));
                    }
                }
                Ok(roots.into_iter().collect())
            },
        }
    }

    /*  Coerces one raw target into a typed node: resolve selectors
        against the platform, check the schema, gather deps and input
        files, and verify the package boundary. */
    pub fn resolve_node(
        &self,
        raw : &RawTargetNode,
        cell_name : &str,
        package : &str) -> Result<TargetNode, ResolveError>
    {
        let target = BuildTarget::new(cell_name, package, &raw.name);

        let description =
        match self.registry.get(&raw.rule_type)
        {
            Some(description) => description,
            None => return Err(ResolveError::UnknownRuleType(
                target, raw.rule_type.clone())),
        };

        let ctx = CoerceContext
        {
            cells : &self.cells,
            platform : &self.platform,
            cell : cell_name,
            package : package,
        };

        let schema = description.schema();
        let mut attrs = std::collections::BTreeMap::new();
        let mut visibility = vec![];
        let mut tests = vec![];
        let mut runtime_deps = vec![];

        for (attribute, raw_value) in &raw.attrs
        {
            let resolved =
            match resolve_selects(raw_value, attribute, &self.platform)
            {
                Ok(resolved) => resolved,
                Err(error) => return Err(ResolveError::Coerce(target, error)),
            };

            /*  Attributes every rule carries. */
            match attribute.as_str()
            {
                "visibility" =>
                {
                    let items =
                    match coerce(&resolved, AttrType::StrList, attribute, &ctx)
                    {
                        Ok(CoercedAttr::StrList(items)) => items,
                        Ok(_) => vec![],
                        Err(error) => return Err(ResolveError::Coerce(target, error)),
                    };
                    for item in items
                    {
                        match VisibilityPattern::parse(&item, &ctx)
                        {
                            Ok(pattern) => visibility.push(pattern),
                            Err(error) => return Err(ResolveError::Coerce(target, error)),
                        }
                    }
                    continue;
                },
                "tests" =>
                {
                    match coerce(&resolved, AttrType::TargetList, attribute, &ctx)
                    {
                        Ok(CoercedAttr::Targets(items)) => tests = items,
                        Ok(_) => {},
                        Err(error) => return Err(ResolveError::Coerce(target, error)),
                    }
                    continue;
                },
                "runtime_deps" =>
                {
                    match coerce(&resolved, AttrType::TargetList, attribute, &ctx)
                    {
                        Ok(CoercedAttr::Targets(items)) => runtime_deps = items,
                        Ok(_) => {},
                        Err(error) => return Err(ResolveError::Coerce(target, error)),
                    }
                    continue;
                },
                _ => {},
            }

            let spec =
            match schema.iter().find(|spec| spec.name == attribute.as_str())
            {
                Some(spec) => spec,
                None => return Err(ResolveError::Coerce(
                    target,
                    CoerceError::UnknownAttribute(attribute.clone()))),
            };

            match coerce(&resolved, spec.attr_type, attribute, &ctx)
            {
                Ok(value) =>
                {
                    attrs.insert(attribute.clone(), value);
                },
                Err(error) => return Err(ResolveError::Coerce(target, error)),
            }
        }

        for spec in &schema
        {
            if spec.required && !attrs.contains_key(spec.name)
            {
                return Err(ResolveError::Coerce(
                    target,
                    CoerceError::MissingAttribute(spec.name.to_string())));
            }
        }

        /*  Deps and input files fall out of the coerced values. */
        let mut declared_deps = vec![];
        let mut inputs = vec![];
        for (_attribute, value) in &attrs
        {
            match value
            {
                CoercedAttr::Dep(dep) => declared_deps.push(dep.clone()),
                CoercedAttr::Deps(deps) =>
                {
                    for dep in deps
                    {
                        declared_deps.push(dep.clone());
                    }
                },
                CoercedAttr::Sources(sources) =>
                {
                    for source in sources
                    {
                        match source
                        {
                            SourceRef::Target(dep) => declared_deps.push(dep.clone()),
                            SourceRef::File(path) => inputs.push(path.clone()),
                        }
                    }
                },
                _ => {},
            }
        }
        inputs.sort();
        inputs.dedup();

        let extra_deps =
        match description.implicit_deps(&target, &attrs, &ctx)
        {
            Ok(extra_deps) => extra_deps,
            Err(error) => return Err(ResolveError::Coerce(target, error)),
        };

        self.check_package_boundary(&target, package, &inputs)?;

        Ok(TargetNode
        {
            target : target,
            rule_type : description.rule_type(),
            attrs : attrs,
            declared_deps : declared_deps,
            extra_deps : extra_deps,
            runtime_deps : runtime_deps,
            tests : tests,
            visibility : visibility,
            inputs : inputs,
        })
    }

    /*  A target's input files must belong to the package that declares
        the target, not to some deeper package with its own build file.
        The project can switch the check off. */
    fn check_package_boundary(
        &self,
        target : &BuildTarget,
        package : &str,
        inputs : &Vec<String>) -> Result<(), ResolveError>
    {
        let cell =
        match self.cells.get(&target.cell)
        {
            Ok(cell) => cell,
            Err(error) => return Err(ResolveError::Cell(error)),
        };

        if !cell.config.get_bool("project", "check_package_boundary", true)
        {
            return Ok(());
        }

        for input in inputs
        {
            /*  The package-relative remainder of the input path. */
            let remainder =
            if package == ""
            {
                input.as_str()
            }
            else if input.starts_with(&format!("{}/", package))
            {
                &input[package.len()+1..]
            }
            else
            {
                continue;
            };

            let mut walked = package.to_string();
            let components : Vec<&str> = remainder.split('/').collect();
            for component in &components[..components.len().saturating_sub(1)]
            {
                walked =
                if walked == ""
                {
                    component.to_string()
                }
                else
                {
                    format!("{}/{}", walked, component)
                };

                if self.system.is_file(&cell.build_file_path(&walked))
                {
                    return Err(ResolveError::PackageBoundary
                    {
                        target : target.clone(),
                        input : input.clone(),
                        owning_package : walked,
                    });
                }
            }
        }

        Ok(())
    }

    pub fn parse_patterns(
        &self,
        texts : &Vec<String>) -> Result<Vec<TargetPattern>, ResolveError>
    {
        let mut patterns = vec![];
        for text in texts
        {
            match TargetPattern::parse(text, self.cells.root_cell_name())
            {
                Ok(pattern) => patterns.push(pattern),
                Err(error) => return Err(ResolveError::BadPattern(text.clone(), error)),
            }
        }
        Ok(patterns)
    }
}

#[cfg(test)]
mod test
{
    use crate::cell::CellResolver;
    use crate::coerce::CoerceError;
    use crate::config::
    {
        Config,
        Platform,
    };
    use crate::evaluator::Evaluator;
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

    #[test]
    fn expand_recursive_pattern_finds_build_files()
    {
        let mut system = FakeSystem::new(10);
        write_str_to_file(&mut system, "pkg/BUILD", "").unwrap();
        write_str_to_file(&mut system, "pkg/deep/BUILD", "").unwrap();
        write_str_to_file(&mut system, "pkg/deep/deeper/BUILD", "").unwrap();
        write_str_to_file(&mut system, "pkg/no_build_file/note.txt", "").unwrap();
        write_str_to_file(&mut system, "unrelated/BUILD", "").unwrap();

        let resolver = resolver_for(&system);
        let packages = resolver.expand_pattern(
            &TargetPattern::parse("//pkg/...", "root").unwrap()).unwrap();

        assert_eq!(packages, vec![
            ("root".to_string(), "pkg".to_string()),
            ("root".to_string(), "pkg/deep".to_string()),
            ("root".to_string(), "pkg/deep/deeper".to_string())]);
    }

    #[test]
    fn expand_single_and_package_patterns()
    {
        let system = FakeSystem::new(10);
        let resolver = resolver_for(&system);

        assert_eq!(
            resolver.expand_pattern(&TargetPattern::parse("//pkg:thing", "root").unwrap()).unwrap(),
            vec![("root".to_string(), "pkg".to_string())]);
        assert_eq!(
            resolver.expand_pattern(&TargetPattern::parse("//pkg/sub:", "root").unwrap()).unwrap(),
            vec![("root".to_string(), "pkg/sub".to_string())]);
    }

    #[test]
    fn resolve_node_from_manifest()
    {
        let mut system = FakeSystem::new(10);
        write_str_to_file(&mut system, "pkg/a.c", "").unwrap();
        write_str_to_file(&mut system, "pkg/BUILD", "\
genrule {
    name = \"lib\",
    srcs = {\"a.c\", \":gen\"},
    cmd = {\"concat\", \"$SRCS\", \"$OUT\"},
    out = \"lib.a\",
    visibility = {\"PUBLIC\"},
    runtime_deps = {\":runner\"},
    tests = {\":lib_test\"},
}
").unwrap();

        let resolver = resolver_for(&system);
        let evaluator = Evaluator::new(
            system.clone(),
            resolver.cells.clone(),
            resolver.registry.clone()).unwrap();
        let manifest = evaluator.evaluate("root", "pkg").unwrap();

        let node = resolver.resolve_node(
            manifest.targets.get("lib").unwrap(), "root", "pkg").unwrap();

        assert_eq!(node.target, BuildTarget::new("root", "pkg", "lib"));
        assert_eq!(node.declared_deps, vec![BuildTarget::new("root", "pkg", "gen")]);
        assert_eq!(node.runtime_deps, vec![BuildTarget::new("root", "pkg", "runner")]);
        assert_eq!(node.tests, vec![BuildTarget::new("root", "pkg", "lib_test")]);
        assert_eq!(node.inputs, vec!["pkg/a.c".to_string()]);
        assert_eq!(node.visibility.len(), 1);
    }

    #[test]
    fn resolve_node_unknown_rule_type_is_an_error()
    {
        let mut system = FakeSystem::new(10);
        write_str_to_file(&mut system, "pkg/BUILD", "").unwrap();
        let resolver = resolver_for(&system);

        let raw = crate::attr::RawTargetNode
        {
            name : "mystery".to_string(),
            rule_type : "cxx_library".to_string(),
            attrs : std::collections::BTreeMap::new(),
        };

        match resolver.resolve_node(&raw, "root", "pkg")
        {
            Err(ResolveError::UnknownRuleType(_target, name)) => assert_eq!(name, "cxx_library"),
            other => panic!("Wrong result: {:?}", other.map(|node| node.target)),
        }
    }

    #[test]
    fn resolve_node_unknown_attribute_is_an_error()
    {
        let mut system = FakeSystem::new(10);
        write_str_to_file(&mut system, "pkg/BUILD", "\
write_file {
    name = \"x\",
    content = \"y\",
    out = \"x.txt\",
    sparkles = true,
}
").unwrap();

        let resolver = resolver_for(&system);
        let evaluator = Evaluator::new(
            system.clone(),
            resolver.cells.clone(),
            resolver.registry.clone()).unwrap();
        let manifest = evaluator.evaluate("root", "pkg").unwrap();

        match resolver.resolve_node(manifest.targets.get("x").unwrap(), "root", "pkg")
        {
            Err(ResolveError::Coerce(_target, CoerceError::UnknownAttribute(name))) =>
                assert_eq!(name, "sparkles"),
            other => panic!("Wrong result: {:?}", other.map(|node| node.target)),
        }
    }

    #[test]
    fn resolve_node_missing_required_attribute_is_an_error()
    {
        let mut system = FakeSystem::new(10);
        write_str_to_file(&mut system, "pkg/BUILD", "\
write_file {
    name = \"x\",
    content = \"y\",
}
").unwrap();

        let resolver = resolver_for(&system);
        let evaluator = Evaluator::new(
            system.clone(),
            resolver.cells.clone(),
            resolver.registry.clone()).unwrap();
        let manifest = evaluator.evaluate("root", "pkg").unwrap();

        match resolver.resolve_node(manifest.targets.get("x").unwrap(), "root", "pkg")
        {
            Err(ResolveError::Coerce(_target, CoerceError::MissingAttribute(name))) =>
                assert_eq!(name, "out"),
            other => panic!("Wrong result: {:?}", other.map(|node| node.target)),
        }
    }

    #[test]
    fn resolve_node_select_picks_platform_branch()
    {
        let mut system = FakeSystem::new(10);
        write_str_to_file(&mut system, "quarry.toml", "\
[platform]
name = \"linux\"
constraints = \"os=linux\"
").unwrap();
        write_str_to_file(&mut system, "pkg/linux.c", "").unwrap();
        write_str_to_file(&mut system, "pkg/BUILD", "\
genrule {
    name = \"lib\",
    srcs = select{
        [\"os=linux\"] = {\"linux.c\"},
        [\"os=macos\"] = {\"macos.c\"},
        DEFAULT = {},
    },
    cmd = {\"concat\", \"$SRCS\", \"$OUT\"},
    out = \"lib.a\",
}
").unwrap();

        let resolver = resolver_for(&system);
        let evaluator = Evaluator::new(
            system.clone(),
            resolver.cells.clone(),
            resolver.registry.clone()).unwrap();
        let manifest = evaluator.evaluate("root", "pkg").unwrap();

        let node = resolver.resolve_node(
            manifest.targets.get("lib").unwrap(), "root", "pkg").unwrap();
        assert_eq!(node.inputs, vec!["pkg/linux.c".to_string()]);
    }

    #[test]
    fn resolve_node_implicit_location_deps_are_extra_deps()
    {
        let mut system = FakeSystem::new(10);
        write_str_to_file(&mut system, "pkg/BUILD", "\
genrule {
    name = \"consumer\",
    cmd = {\"copy\", \"$(location //tools:maker)\", \"$OUT\"},
    out = \"copy.txt\",
}
").unwrap();

        let resolver = resolver_for(&system);
        let evaluator = Evaluator::new(
            system.clone(),
            resolver.cells.clone(),
            resolver.registry.clone()).unwrap();
        let manifest = evaluator.evaluate("root", "pkg").unwrap();

        let node = resolver.resolve_node(
            manifest.targets.get("consumer").unwrap(), "root", "pkg").unwrap();
        assert_eq!(node.extra_deps, vec![BuildTarget::new("root", "tools", "maker")]);
        assert_eq!(
            node.parse_time_deps(),
            vec![BuildTarget::new("root", "tools", "maker")]);
    }

    #[test]
    fn package_boundary_violation_is_an_error()
    {
        let mut system = FakeSystem::new(10);
        write_str_to_file(&mut system, "pkg/sub/BUILD", "").unwrap();
        write_str_to_file(&mut system, "pkg/sub/owned.c", "").unwrap();
        write_str_to_file(&mut system, "pkg/BUILD", "\
genrule {
    name = \"trespasser\",
    srcs = {\"sub/owned.c\"},
    cmd = {\"concat\", \"$SRCS\", \"$OUT\"},
    out = \"out.txt\",
}
").unwrap();

        let resolver = resolver_for(&system);
        let evaluator = Evaluator::new(
            system.clone(),
            resolver.cells.clone(),
            resolver.registry.clone()).unwrap();
        let manifest = evaluator.evaluate("root", "pkg").unwrap();

        match resolver.resolve_node(manifest.targets.get("trespasser").unwrap(), "root", "pkg")
        {
            Err(ResolveError::PackageBoundary{input, owning_package, ..}) =>
            {
                assert_eq!(input, "pkg/sub/owned.c");
                assert_eq!(owning_package, "pkg/sub");
            },
            other => panic!("Wrong result: {:?}", other.map(|node| node.target)),
        }
    }

    #[test]
    fn package_boundary_check_can_be_disabled()
    {
        let mut system = FakeSystem::new(10);
        write_str_to_file(&mut system, "quarry.toml", "\
[project]
check_package_boundary = false
").unwrap();
        write_str_to_file(&mut system, "pkg/sub/BUILD", "").unwrap();
        write_str_to_file(&mut system, "pkg/sub/owned.c", "").unwrap();
        write_str_to_file(&mut system, "pkg/BUILD", "\
genrule {
    name = \"trespasser\",
    srcs = {\"sub/owned.c\"},
    cmd = {\"concat\", \"$SRCS\", \"$OUT\"},
    out = \"out.txt\",
}
").unwrap();

        let resolver = resolver_for(&system);
        let evaluator = Evaluator::new(
            system.clone(),
            resolver.cells.clone(),
            resolver.registry.clone()).unwrap();
        let manifest = evaluator.evaluate("root", "pkg").unwrap();

        assert!(resolver.resolve_node(
            manifest.targets.get("trespasser").unwrap(), "root", "pkg").is_ok());
    }

    #[test]
    fn parse_patterns_bad_pattern_is_an_error()
    {
        let system = FakeSystem::new(10);
        let resolver = resolver_for(&system);
        match resolver.parse_patterns(&vec!["not a pattern".to_string()])
        {
            Err(ResolveError::BadPattern(text, _error)) => assert_eq!(text, "not a pattern"),
            other => panic!("Wrong result: {:?}", other.map(|patterns| patterns.len())),
        }
    }
}
