extern crate clap;
extern crate clap_derive;
extern crate serde;
extern crate toml;

use clap::Parser;
use clap_derive::
{
    Parser,
    Subcommand,
};

use crate::printer::StandardPrinter;
use crate::system::real::RealSystem;

mod action;
mod artifact;
mod assembler;
mod attr;
mod build;
mod cell;
mod coerce;
mod config;
mod engine;
mod evaluator;
mod event;
mod filehash;
mod fingerprint;
mod graph;
mod node;
mod printer;
mod resolver;
mod rulekey;
mod rules;
mod server;
mod system;
mod target;

#[derive(Parser)]
struct BuildConfig
{
    #[arg(index=1, required=true, value_name = "PATTERN", help =
"Target patterns to build: //pkg:name for one target, //pkg: for every
target in a package, //pkg/... for every target under a subtree.")]
    patterns : Vec<String>,

    #[arg(short, long, value_name = "N", help =
"How many rules may run their build steps at once.  Defaults to the
build.jobs configuration value.")]
    jobs : Option<usize>,

    #[arg(short, long, help =
"Keep building independent roots after a rule fails.  Only the failing
rule's dependents are canceled.")]
    keep_going : bool,

    #[arg(long, help =
"Skip the artifact caches entirely: no probes, no uploads.")]
    no_cache : bool,

    #[arg(long, help =
"Build everything locally and upload, without probing for hits first.")]
    populate_cache_only : bool,
}

#[derive(Parser)]
struct TargetsConfig
{
    #[arg(index=1, required=true, value_name = "PATTERN", help =
"Target patterns to resolve and list.")]
    patterns : Vec<String>,
}

#[derive(Subcommand)]
enum AuditSubcommand
{
    #[command(about="Show configuration values as the build sees them")]
    Config
    {
        #[arg(value_name = "SECTION.KEY")]
        keys : Vec<String>,
    },

    #[command(about="Show the extension files a package's build file loads")]
    Includes
    {
        #[arg(value_name = "PACKAGE")]
        package : String,
    },

    #[command(about="Show a target's default rule key")]
    Rulekey
    {
        #[arg(value_name = "TARGET")]
        target : String,
    },
}

#[derive(Parser)]
struct AuditConfig
{
    #[command(subcommand)]
    what : AuditSubcommand,
}

#[derive(Parser)]
struct ServeConfig
{
    #[arg(index=1, value_name = "PORT", default_value="8090", help =
"An HTTP port number on which to serve the artifact cache")]
    port : u16,

    #[arg(short, long, default_value="quarry-out", help =
"The output root whose cache directory to serve")]
    directory : String,
}

#[derive(Subcommand)]
enum QuarrySubcommand
{
    #[command(about="Builds the given target patterns", long_about=
"Builds every target the given patterns name, reusing cached artifacts
where the rule keys match and uploading whatever gets built locally.")]
    Build(BuildConfig),

    #[command(about="Lists the targets the given patterns name")]
    Targets(TargetsConfig),

    #[command(about="Inspects configuration, includes and rule keys")]
    Audit(AuditConfig),

    #[command(about="Serves the local artifact cache over HTTP", long_about =
"Starts a server which provides cached artifacts to other machines;
point their build.cache_url configuration at it.")]
    Serve(ServeConfig),
}

#[derive(Parser)]
#[command(version = "0.1.0",
    about = "A multi-cell, content-addressed build system",
    long_about = "Quarry turns build target patterns into a reproducible,
cached set of built artifacts.")]
struct CommandLineParser
{
    #[command(subcommand)]
    command : QuarrySubcommand,

    #[arg(short, long, value_name = "SECTION.KEY=VALUE", help =
"Overrides one configuration value for this invocation.  Repeatable.")]
    config : Vec<String>,
}

fn main()
{
    let command_line =
    match CommandLineParser::try_parse()
    {
        Ok(command_line) => command_line,
        Err(error) =>
        {
            match error.kind()
            {
                clap::error::ErrorKind::DisplayHelp
                | clap::error::ErrorKind::DisplayVersion =>
                {
                    match error.print()
                    {
                        Ok(()) => {},
                        Err(_error) => {},
                    }
                    std::process::exit(0);
                },
                _ =>
                {
                    match error.print()
                    {
                        Ok(()) => {},
                        Err(_error) => {},
                    }
                    std::process::exit(3);
                },
            }
        },
    };

    let config_overrides = command_line.config;

    match command_line.command
    {
        QuarrySubcommand::Build(build_config) =>
        {
            let mut params = build::BuildParams::new(build_config.patterns);
            params.config_overrides = config_overrides;
            params.jobs = build_config.jobs;
            params.keep_going = build_config.keep_going;
            params.no_cache = build_config.no_cache;
            params.populate_cache_only = build_config.populate_cache_only;

            match build::build(RealSystem::new(), &mut StandardPrinter::new(), params)
            {
                Ok(_outcome) => {},
                Err(error) =>
                {
                    eprintln!("{}", error);
                    std::process::exit(build::exit_code_for(&error));
                },
            }
        },
        QuarrySubcommand::Targets(targets_config) =>
        {
            match build::targets(
                RealSystem::new(),
                &mut StandardPrinter::new(),
                targets_config.patterns,
                config_overrides)
            {
                Ok(_labels) => {},
                Err(error) =>
                {
                    eprintln!("{}", error);
                    std::process::exit(build::exit_code_for(&error));
                },
            }
        },
        QuarrySubcommand::Audit(audit_config) =>
        {
            let result =
            match audit_config.what
            {
                AuditSubcommand::Config{keys} =>
                    build::audit_config(
                        RealSystem::new(),
                        &mut StandardPrinter::new(),
                        keys,
                        config_overrides).map(|_lines| ()),

                AuditSubcommand::Includes{package} =>
                    build::audit_includes(
                        RealSystem::new(),
                        &mut StandardPrinter::new(),
                        package,
                        config_overrides).map(|_includes| ()),

                AuditSubcommand::Rulekey{target} =>
                    build::audit_rulekey(
                        RealSystem::new(),
                        &mut StandardPrinter::new(),
                        target,
                        config_overrides).map(|_line| ()),
            };

            match result
            {
                Ok(()) => {},
                Err(error) =>
                {
                    eprintln!("{}", error);
                    std::process::exit(build::exit_code_for(&error));
                },
            }
        },
        QuarrySubcommand::Serve(serve_config) =>
        {
            match server::serve(&serve_config.directory, serve_config.port)
            {
                Ok(()) => {},
                Err(error) =>
                {
                    eprintln!("{}", error);
                    std::process::exit(10);
                },
            }
        },
    }
}
