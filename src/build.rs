use crate::action::
{
    ActionGraphBuilder,
    OutputLayout,
    SourcePathResolver,
};
use crate::artifact::
{
    ArtifactCache,
    DirCache,
    HttpCache,
    LayeredCache,
    MemoryCache,
    NoopCache,
};
use crate::assembler::
{
    AssembleError,
    AssembleResult,
    assemble,
};
use crate::cell::
{
    CellError,
    CellResolver,
};
use crate::config::Platform;
use crate::engine::
{
    BuildOutcome,
    EngineError,
    EngineOptions,
    execute,
};
use crate::evaluator::
{
    Evaluator,
    ParseError,
    ParseErrorKind,
};
use crate::event::
{
    EventBus,
    RuleOutcome,
};
use crate::filehash::
{
    FileHashCache,
    HashMode,
};
use crate::printer::Printer;
use crate::resolver::TargetResolver;
use crate::rulekey::
{
    KeyKind,
    RuleKeyCache,
    RuleKeyFactory,
    graph_identity,
};
use crate::rules::Registry;
use crate::system::
{
    System,
    SystemError,
};
use crate::target::BuildTarget;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use termcolor::Color;

#[derive(Debug)]
pub enum CommandError
{
    Cell(CellError),
    Assemble(AssembleError),
    Engine(EngineError),
    Parse(ParseError),
    OutputRootFailed(SystemError),
    BuildFailed,
}

impl fmt::Display for CommandError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            CommandError::Cell(error) =>
                write!(formatter, "{}", error),

            CommandError::Assemble(error) =>
                write!(formatter, "{}", error),

            CommandError::Engine(error) =>
                write!(formatter, "{}", error),

            CommandError::Parse(error) =>
                write!(formatter, "{}", error),

            CommandError::OutputRootFailed(error) =>
                write!(formatter, "Failed to initialize the output root: {}", error),

            CommandError::BuildFailed =>
                write!(formatter, "Build failed"),
        }
    }
}

/*  Exit codes: 0 success, 1 build error, 2 parse/user-input error in
    the build graph, 3 bad command line (mapped by main), 10 and up for
    internal trouble. */
pub fn exit_code_for(error : &CommandError) -> i32
{
    match error
    {
        CommandError::BuildFailed => 1,
        CommandError::Cell(_) => 2,
        CommandError::Parse(_) => 2,
        CommandError::Assemble(AssembleError::Resolve(_)) => 2,
        CommandError::Assemble(AssembleError::Graph(_)) => 2,
        CommandError::Assemble(AssembleError::WorkerFailed) => 10,
        CommandError::Engine(_) => 10,
        CommandError::OutputRootFailed(_) => 10,
    }
}

/*  Everything a build-shaped command takes from the command line. */
pub struct BuildParams
{
    pub patterns : Vec<String>,
    pub config_overrides : Vec<String>,
    pub jobs : Option<usize>,
    pub keep_going : bool,
    pub no_cache : bool,
    pub populate_cache_only : bool,
}

impl BuildParams
{
    pub fn new(patterns : Vec<String>) -> BuildParams
    {
        BuildParams
        {
            patterns : patterns,
            config_overrides : vec![],
            jobs : None,
            keep_going : false,
            no_cache : false,
            populate_cache_only : false,
        }
    }
}

fn make_resolver<SystemType : System>
(
    system : &SystemType,
    config_overrides : &Vec<String>
)
-> Result<TargetResolver<SystemType>, CommandError>
{
    let cells =
    match CellResolver::load(system, config_overrides)
    {
        Ok(cells) => cells,
        Err(error) => return Err(CommandError::Cell(error)),
    };

    let platform = Platform::from_config(&cells.root_cell().config);

    Ok(TargetResolver
    {
        system : system.clone(),
        cells : cells,
        platform : platform,
        registry : Arc::new(Registry::with_builtins()),
    })
}

fn assemble_for_patterns<SystemType : System + 'static>
(
    resolver : &TargetResolver<SystemType>,
    pattern_texts : &Vec<String>,
    parser_threads : usize
)
-> Result<AssembleResult, CommandError>
{
    let patterns =
    match resolver.parse_patterns(pattern_texts)
    {
        Ok(patterns) => patterns,
        Err(error) => return Err(CommandError::Assemble(AssembleError::Resolve(error))),
    };

    match assemble(resolver, &patterns, parser_threads, HashMap::new())
    {
        Ok(result) => Ok(result),
        Err(error) => Err(CommandError::Assemble(error)),
    }
}

fn init_output_root<SystemType : System>
(
    system : &mut SystemType,
    layout : &OutputLayout
)
-> Result<(), CommandError>
{
    for path in [
        layout.gen_root(),
        layout.scratch_root(),
        layout.last_root(),
        layout.cache_root()].iter()
    {
        match system.create_dir_all(path)
        {
            Ok(()) => {},
            Err(error) => return Err(CommandError::OutputRootFailed(error)),
        }
    }
    Ok(())
}

fn make_cache<SystemType : System + 'static>
(
    system : &SystemType,
    layout : &OutputLayout,
    no_cache : bool,
    cache_url : Option<String>
)
-> Arc<dyn ArtifactCache>
{
    if no_cache
    {
        return Arc::new(NoopCache{});
    }

    let mut layers : Vec<Box<dyn ArtifactCache>> = vec![
        Box::new(MemoryCache::new()),
        Box::new(DirCache::new(system.clone(), &layout.cache_root())),
    ];

    match cache_url
    {
        Some(url) => layers.push(Box::new(HttpCache::new(&url))),
        None => {},
    }

    Arc::new(LayeredCache::new(layers))
}

/*  This is the function that runs when you type "quarry build" at the
    command line: pattern resolution, target graph, action graph, rule
    keys, and the caching engine, wired together from the project
    configuration. */
pub fn build<SystemType : System + 'static, PrinterType : Printer>
(
    system : SystemType,
    printer : &mut PrinterType,
    params : BuildParams
)
-> Result<BuildOutcome, CommandError>
{
    let mut system = system;
    let resolver = make_resolver(&system, &params.config_overrides)?;
    let config = resolver.cells.root_cell().config.clone();

    let jobs =
    match params.jobs
    {
        Some(jobs) => jobs,
        None => config.get_usize("build", "jobs", 2),
    };

    let assembled = assemble_for_patterns(&resolver, &params.patterns, jobs)?;

    let layout = OutputLayout::new(&config.get_or("project", "out_dir", "quarry-out"));
    init_output_root(&mut system, &layout)?;

    let identity = graph_identity(&assembled.graph);
    let builder = Arc::new(ActionGraphBuilder::new(
        Arc::new(assembled.graph),
        resolver.registry.clone(),
        Arc::new(SourcePathResolver
        {
            cells : resolver.cells.clone(),
            layout : layout.clone(),
        })));

    let hash_mode = HashMode::from_config_value(
        &config.get_or("build", "file_hash_mode", "contents"));
    let key_seed = config.get_or("build", "key_seed", "");
    let factory = Arc::new(RuleKeyFactory::new(
        FileHashCache::new(system.clone(), hash_mode),
        &key_seed,
        Arc::new(RuleKeyCache::new(&key_seed, identity))));

    let cache = make_cache(
        &system,
        &layout,
        params.no_cache,
        config.get("build", "cache_url").map(|url| url.to_string()));

    let step_timeout_ms =
    match config.get("build", "step_timeout_ms")
    {
        Some(text) => text.parse::<u64>().ok(),
        None => None,
    };

    let bus = EventBus::new();
    let subscription = bus.subscribe(65536);

    let outcome =
    match execute(
        &system,
        builder,
        factory,
        cache,
        &bus,
        &assembled.roots,
        EngineOptions
        {
            jobs : jobs,
            keep_going : params.keep_going,
            populate_cache_only : params.populate_cache_only,
            step_timeout_ms : step_timeout_ms,
            origin : config.get_or("build", "origin", "local"),
        },
        Arc::new(AtomicBool::new(false)))
    {
        Ok(outcome) => outcome,
        Err(error) => return Err(CommandError::Engine(error)),
    };

    for (target, result) in &outcome.results
    {
        let (banner_text, banner_color) =
        match result
        {
            RuleOutcome::Built =>
                ("     Built", Color::Magenta),

            RuleOutcome::CacheHit(_source) =>
                ("    Cached", Color::Cyan),

            RuleOutcome::Failed(_message) =>
                ("    Failed", Color::Red),

            RuleOutcome::Canceled =>
                ("  Canceled", Color::Yellow),
        };
        printer.banner_line(banner_text, banner_color, &format!("{}", target));

        match result
        {
            RuleOutcome::Failed(message) => printer.error(message),
            _ => {},
        }
    }

    for event in subscription.drain()
    {
        match event
        {
            crate::event::BuildEvent::CacheTrouble{target, message} =>
                printer.error(&format!("cache trouble for {}: {}", target, message)),
            _ => {},
        }
    }

    if subscription.dropped() > 0
    {
        printer.error(&format!("{} events dropped", subscription.dropped()));
    }

    if outcome.success
    {
        Ok(outcome)
    }
    else
    {
        Err(CommandError::BuildFailed)
    }
}

/*  "quarry targets": resolve the patterns and list what they name. */
pub fn targets<SystemType : System + 'static, PrinterType : Printer>
(
    system : SystemType,
    printer : &mut PrinterType,
    pattern_texts : Vec<String>,
    config_overrides : Vec<String>
)
-> Result<Vec<String>, CommandError>
{
    let resolver = make_resolver(&system, &config_overrides)?;
    let assembled = assemble_for_patterns(&resolver, &pattern_texts, 2)?;

    let mut labels : Vec<String> = assembled.roots
        .iter()
        .map(|target| format!("{}", target))
        .collect();
    labels.sort();

    for label in &labels
    {
        printer.print(label);
    }
    Ok(labels)
}

/*  "quarry audit config section.key ...": the configuration values as
    the build would see them. */
pub fn audit_config<SystemType : System, PrinterType : Printer>
(
    system : SystemType,
    printer : &mut PrinterType,
    keys : Vec<String>,
    config_overrides : Vec<String>
)
-> Result<Vec<String>, CommandError>
{
    let resolver = make_resolver(&system, &config_overrides)?;
    let config = &resolver.cells.root_cell().config;

    let mut lines = vec![];
    if keys.len() == 0
    {
        for line in config.render().lines()
        {
            lines.push(line.to_string());
        }
    }
    else
    {
        for key_text in keys
        {
            let (section, key) =
            match key_text.find('.')
            {
                Some(index) => (&key_text[..index], &key_text[index+1..]),
                None => (key_text.as_str(), ""),
            };
            match config.get(section, key)
            {
                Some(value) => lines.push(format!("{}.{} = {}", section, key, value)),
                None => lines.push(format!("{}.{} is not set", section, key)),
            }
        }
    }

    for line in &lines
    {
        printer.print(line);
    }
    Ok(lines)
}

/*  "quarry audit includes //pkg": the extension files the package's
    build file pulls in, in load order. */
pub fn audit_includes<SystemType : System + 'static, PrinterType : Printer>
(
    system : SystemType,
    printer : &mut PrinterType,
    package_label : String,
    config_overrides : Vec<String>
)
-> Result<Vec<String>, CommandError>
{
    let resolver = make_resolver(&system, &config_overrides)?;

    let trimmed =
    match package_label.find("//")
    {
        Some(index) =>
        {
            let cell_text = &package_label[..index];
            let cell =
            if cell_text == ""
            {
                resolver.cells.root_cell_name().to_string()
            }
            else
            {
                cell_text.trim_start_matches('@').to_string()
            };
            (cell, package_label[index+2..].trim_end_matches('/').to_string())
        },
        None =>
        {
            return Err(CommandError::Parse(ParseError::new(
                ParseErrorKind::BadLoadLabel,
                &package_label,
                "package label must look like //path".to_string())));
        },
    };

    let evaluator =
    match Evaluator::new(system.clone(), resolver.cells.clone(), resolver.registry.clone())
    {
        Ok(evaluator) => evaluator,
        Err(error) => return Err(CommandError::Parse(error)),
    };

    let includes =
    match evaluator.get_includes(&trimmed.0, &trimmed.1)
    {
        Ok(includes) => includes,
        Err(error) => return Err(CommandError::Parse(error)),
    };

    for include in &includes
    {
        printer.print(include);
    }
    Ok(includes)
}

/*  "quarry audit rulekey //pkg:target": the default rule key, which is
    what the cache is addressed by. */
pub fn audit_rulekey<SystemType : System + 'static, PrinterType : Printer>
(
    system : SystemType,
    printer : &mut PrinterType,
    target_label : String,
    config_overrides : Vec<String>
)
-> Result<String, CommandError>
{
    let resolver = make_resolver(&system, &config_overrides)?;
    let config = resolver.cells.root_cell().config.clone();
    let assembled = assemble_for_patterns(&resolver, &vec![target_label.clone()], 2)?;

    let target =
    match assembled.roots.first()
    {
        Some(target) => target.clone(),
        None => return Err(CommandError::Assemble(AssembleError::Resolve(
            crate::resolver::ResolveError::UnknownTarget(
                BuildTarget::new(resolver.cells.root_cell_name(), "", &target_label))))),
    };

    let layout = OutputLayout::new(&config.get_or("project", "out_dir", "quarry-out"));
    let identity = graph_identity(&assembled.graph);
    let builder = ActionGraphBuilder::new(
        Arc::new(assembled.graph),
        resolver.registry.clone(),
        Arc::new(SourcePathResolver
        {
            cells : resolver.cells.clone(),
            layout : layout,
        }));

    let key_seed = config.get_or("build", "key_seed", "");
    let factory = RuleKeyFactory::new(
        FileHashCache::new(system.clone(), HashMode::from_config_value(
            &config.get_or("build", "file_hash_mode", "contents"))),
        &key_seed,
        Arc::new(RuleKeyCache::new(&key_seed, identity)));

    let rule =
    match builder.require_rule(&target)
    {
        Ok(rule) => rule,
        Err(error) => return Err(CommandError::Engine(EngineError::Internal(format!("{}", error)))),
    };

    let key =
    match factory.compute(&builder, &rule, KeyKind::Default)
    {
        Ok(key) => key,
        Err(error) => return Err(CommandError::Engine(EngineError::Internal(format!("{}", error)))),
    };

    let line = format!("{} {}", target, key);
    printer.print(&line);
    Ok(line)
}
