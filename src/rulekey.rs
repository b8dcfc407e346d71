use crate::action::
{
    ActionError,
    ActionGraphBuilder,
    BuildRule,
    KeyField,
};
use crate::filehash::FileHashCache;
use crate::fingerprint::
{
    Fingerprint,
    FingerprintFactory,
};
use crate::graph::TargetGraph;
use crate::system::
{
    ReadWriteError,
    System,
};
use crate::target::BuildTarget;
use std::collections::HashMap;
use std::fmt;
use std::sync::
{
    Arc,
    Mutex,
};

/*  Bumped whenever the encoding below changes shape, so keys from an
    older scheme can never collide with newer ones. */
pub static RULE_KEY_SCHEMA_VERSION : &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind
{
    Default,
    InputBased,
    DepFile,
}

impl fmt::Display for KeyKind
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            KeyKind::Default => write!(formatter, "default"),
            KeyKind::InputBased => write!(formatter, "input-based"),
            KeyKind::DepFile => write!(formatter, "dep-file"),
        }
    }
}

#[derive(Debug)]
pub enum KeyError
{
    FileFailedToHash(String, ReadWriteError),
    Action(ActionError),
    DepOutputsMissing(BuildTarget),
}

impl fmt::Display for KeyError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            KeyError::FileFailedToHash(path, error) =>
                write!(formatter, "Input file failed to hash: {}: {}", path, error),

            KeyError::Action(error) =>
                write!(formatter, "{}", error),

            KeyError::DepOutputsMissing(target) =>
                write!(formatter, "Dep outputs are not on disk yet, cannot take their digest: {}", target),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedKey
{
    key : Fingerprint,

    /*  The file hashes this entry depended on directly, so a recycled
        cache can re-verify it. */
    file_inputs : Vec<(String, Fingerprint)>,
}

/*  Memoized rule keys, scoped to one build.  The cache can be recycled
    into the next build when the configuration seed and the action
    graph identity both held still; recycled entries are re-verified
    against the file-hash provider and dropped on mismatch. */
pub struct RuleKeyCache
{
    config_seed : String,
    graph_identity : Fingerprint,
    entries : Mutex<HashMap<(BuildTarget, KeyKind), CachedKey>>,
}

impl RuleKeyCache
{
    pub fn new(config_seed : &str, graph_identity : Fingerprint) -> RuleKeyCache
    {
        RuleKeyCache
        {
            config_seed : config_seed.to_string(),
            graph_identity : graph_identity,
            entries : Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize
    {
        self.entries.lock().unwrap().len()
    }

    /*  Carries surviving entries into a cache for the next build. */
    pub fn recycle<SystemType : System>(
        self,
        config_seed : &str,
        graph_identity : Fingerprint,
        file_hashes : &FileHashCache<SystemType>) -> RuleKeyCache
    {
        if self.config_seed != config_seed || self.graph_identity != graph_identity
        {
            return RuleKeyCache::new(config_seed, graph_identity);
        }

        let old_entries = self.entries.into_inner().unwrap();
        let mut kept = HashMap::new();
        for (key, entry) in old_entries
        {
            let mut valid = true;
            for (path, expected) in &entry.file_inputs
            {
                if !file_hashes.entry_still_valid(path, expected)
                {
                    valid = false;
                    break;
                }
            }
            if valid
            {
                kept.insert(key, entry);
            }
        }

        RuleKeyCache
        {
            config_seed : config_seed.to_string(),
            graph_identity : graph_identity,
            entries : Mutex::new(kept),
        }
    }
}

/*  A stable digest of the action graph's shape, used to decide whether
    a rule-key cache can be recycled. */
pub fn graph_identity(graph : &TargetGraph) -> Fingerprint
{
    let mut factory = FingerprintFactory::from_str("graph-identity\n");
    for node in graph.nodes()
    {
        factory.input_str(&format!("{}", node.target));
        factory.input_str("\n");
        factory.input_str(&node.rule_type.name);
        factory.input_str("\n");
        for dep in node.parse_time_deps()
        {
            factory.input_str(&format!(" {}", dep));
        }
        factory.input_str("\n");
    }
    factory.result()
}

/*  Computes content-addressed rule keys.  Every declared field feeds
    the hasher through a typed encoding; dep references recurse through
    the memoizing cache rather than walking raw rule references. */
pub struct RuleKeyFactory<SystemType : System>
{
    file_hashes : FileHashCache<SystemType>,
    seed : String,
    cache : Arc<RuleKeyCache>,
}

impl<SystemType : System> RuleKeyFactory<SystemType>
{
    pub fn new(
        file_hashes : FileHashCache<SystemType>,
        seed : &str,
        cache : Arc<RuleKeyCache>) -> RuleKeyFactory<SystemType>
    {
        RuleKeyFactory
        {
            file_hashes : file_hashes,
            seed : seed.to_string(),
            cache : cache,
        }
    }

    pub fn file_hashes(&self) -> &FileHashCache<SystemType>
    {
        &self.file_hashes
    }

    pub fn compute(
        &self,
        builder : &ActionGraphBuilder,
        rule : &BuildRule,
        kind : KeyKind) -> Result<Fingerprint, KeyError>
    {
        {
            let entries = self.cache.entries.lock().unwrap();
            match entries.get(&(rule.target.clone(), kind))
            {
                Some(cached) => return Ok(cached.key),
                None => {},
            }
        }

        let mut factory = FingerprintFactory::new();
        factory.input_str(RULE_KEY_SCHEMA_VERSION);
        factory.input_str("\x1f");
        factory.input_str(&self.seed);
        factory.input_str("\x1f");
        factory.input_str(&format!("{}", kind));
        factory.input_str("\x1f");
        factory.input_str(&rule.rule_type.name);
        factory.input_str("\x1e");

        let mut file_inputs = vec![];

        for (name, field) in &rule.key_fields
        {
            factory.input_str(name);
            factory.input_str("\x1f");
            self.feed_field(builder, rule, kind, field, &mut factory, &mut file_inputs)?;
            factory.input_str("\x1e");
        }

        let key = factory.result();

        self.cache.entries.lock().unwrap().insert(
            (rule.target.clone(), kind),
            CachedKey
            {
                key : key,
                file_inputs : file_inputs,
            });

        Ok(key)
    }

    fn feed_field(
        &self,
        builder : &ActionGraphBuilder,
        rule : &BuildRule,
        kind : KeyKind,
        field : &KeyField,
        factory : &mut FingerprintFactory,
        file_inputs : &mut Vec<(String, Fingerprint)>) -> Result<(), KeyError>
    {
        match field
        {
            KeyField::Str(text) =>
            {
                factory.input_str("s:");
                factory.input_str(text);
            },

            KeyField::Int(number) =>
            {
                factory.input_str(&format!("i:{}", number));
            },

            KeyField::Bool(flag) =>
            {
                factory.input_str(&format!("b:{}", flag));
            },

            KeyField::StrList(items) =>
            {
                factory.input_str("ls:");
                for item in items
                {
                    factory.input_str(item);
                    factory.input_str("\x1f");
                }
            },

            KeyField::InputPath(path) =>
            {
                self.feed_input_path(path, factory, file_inputs)?;
            },

            KeyField::InputPaths(paths) =>
            {
                factory.input_str("lp:");
                let mut narrowed : Vec<&String> = paths.iter().collect();

                /*  The dep-file key only sees the inputs the rule
                    reported actually consuming. */
                match (kind, &rule.dep_file_inputs)
                {
                    (KeyKind::DepFile, Some(used)) =>
                    {
                        narrowed.retain(|path| used.contains(*path));
                    },
                    _ => {},
                }

                for path in narrowed
                {
                    self.feed_input_path(path, factory, file_inputs)?;
                }
            },

            KeyField::OutputPath(path) =>
            {
                factory.input_str("o:");
                factory.input_str(path);
            },

            KeyField::Dep(dep) =>
            {
                factory.input_str("d:");
                self.feed_dep(builder, kind, dep, factory)?;
            },

            KeyField::Deps(deps) =>
            {
                factory.input_str("ld:");
                for dep in deps
                {
                    self.feed_dep(builder, kind, dep, factory)?;
                    factory.input_str("\x1f");
                }
            },

            KeyField::RuntimeDeps(deps) =>
            {
                /*  Runtime deps feed the default key by label: adding
                    or dropping one changes the rule's identity, but an
                    interface-stable rebuild of the runtime dep does
                    not.  The input-based key ignores them entirely. */
                match kind
                {
                    KeyKind::InputBased => {},
                    _ =>
                    {
                        factory.input_str("lr:");
                        let mut sorted : Vec<String> =
                            deps.iter().map(|dep| format!("{}", dep)).collect();
                        sorted.sort();
                        for label in sorted
                        {
                            factory.input_str(&label);
                            factory.input_str("\x1f");
                        }
                    },
                }
            },
        }
        Ok(())
    }

    fn feed_input_path(
        &self,
        path : &str,
        factory : &mut FingerprintFactory,
        file_inputs : &mut Vec<(String, Fingerprint)>) -> Result<(), KeyError>
    {
        let hash =
        match self.file_hashes.get(path)
        {
            Ok(hash) => hash,
            Err(error) => return Err(KeyError::FileFailedToHash(path.to_string(), error)),
        };
        factory.input_str("p:");
        factory.input_str(path);
        factory.input_str("\x1f");
        factory.input_fingerprint(&hash);
        file_inputs.push((path.to_string(), hash));
        Ok(())
    }

    /*  How a dep reference reaches the hasher depends on the key kind:
        the default and dep-file keys take the dep's own default key,
        while the input-based key takes the digest of the dep's output
        files, its ABI for the purposes of this core. */
    fn feed_dep(
        &self,
        builder : &ActionGraphBuilder,
        kind : KeyKind,
        dep : &BuildTarget,
        factory : &mut FingerprintFactory) -> Result<(), KeyError>
    {
        let dep_rule =
        match builder.require_rule(dep)
        {
            Ok(dep_rule) => dep_rule,
            Err(error) => return Err(KeyError::Action(error)),
        };

        match kind
        {
            KeyKind::Default | KeyKind::DepFile =>
            {
                let dep_key = self.compute(builder, &dep_rule, KeyKind::Default)?;
                factory.input_fingerprint(&dep_key);
            },

            KeyKind::InputBased =>
            {
                for output in &dep_rule.outputs
                {
                    let hash =
                    match self.file_hashes.get(output)
                    {
                        Ok(hash) => hash,
                        Err(_error) => return Err(KeyError::DepOutputsMissing(dep.clone())),
                    };
                    factory.input_str(output);
                    factory.input_str("\x1f");
                    factory.input_fingerprint(&hash);
                }
            },
        }
        Ok(())
    }
}
