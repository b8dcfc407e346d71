use crate::action::
{
    ActionGraphBuilder,
    BuildRule,
    OutputLayout,
    Step,
};
use crate::artifact::
{
    ArtifactCache,
    ArtifactMetadata,
    Bundle,
    CacheResult,
    CacheSource,
};
use crate::event::
{
    BuildEvent,
    EventBus,
    RuleOutcome,
};
use crate::filehash::FileHashCache;
use crate::fingerprint::Fingerprint;
use crate::rulekey::
{
    KeyError,
    KeyKind,
    RuleKeyFactory,
};
use crate::system::System;
use crate::system::util::
{
    read_file,
    write_file,
};
use crate::target::BuildTarget;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::
{
    Arc,
    Mutex,
};
use std::sync::atomic::
{
    AtomicBool,
    Ordering,
};
use std::sync::mpsc;
use std::thread;

#[derive(Debug, Clone)]
pub struct EngineOptions
{
    pub jobs : usize,
    pub keep_going : bool,
    pub populate_cache_only : bool,
    pub step_timeout_ms : Option<u64>,
    pub origin : String,
}

impl EngineOptions
{
    pub fn new() -> EngineOptions
    {
        EngineOptions
        {
            jobs : 1,
            keep_going : false,
            populate_cache_only : false,
            step_timeout_ms : None,
            origin : "local".to_string(),
        }
    }
}

#[derive(Debug)]
pub enum EngineError
{
    Internal(String),
}

impl fmt::Display for EngineError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            EngineError::Internal(message) =>
                write!(formatter, "Build engine failed internally: {}", message),
        }
    }
}

/*  What the whole command learned about each rule it touched. */
pub struct BuildOutcome
{
    pub results : BTreeMap<BuildTarget, RuleOutcome>,
    pub success : bool,
}

enum Job
{
    Start(BuildTarget),
    Resume(BuildTarget),
}

enum ReportBody
{
    Hit(CacheSource),
    NeedsDeps
    {
        deps : Vec<BuildTarget>,
        default_key : Option<Fingerprint>,
    },
    Built,
    StepFailed(String),
    Infra(String),
    Canceled,
}

struct Report
{
    target : BuildTarget,
    body : ReportBody,
}

fn file_name_of(path : &str) -> &str
{
    match path.rfind('/')
    {
        Some(index) => &path[index+1..],
        None => path,
    }
}

/*  Everything one engine worker needs.  Workers run the cache probes
    and the build steps; all lifecycle bookkeeping and event emission
    stay on the coordinator so the event order is total. */
struct WorkerContext<SystemType : System>
{
    system : SystemType,
    builder : Arc<ActionGraphBuilder>,
    factory : Arc<RuleKeyFactory<SystemType>>,
    cache : Arc<dyn ArtifactCache>,
    bus : EventBus,
    options : EngineOptions,
    cancel : Arc<AtomicBool>,
    layout : OutputLayout,
}

impl<SystemType : System> WorkerContext<SystemType>
{
    fn file_hashes(&self) -> &FileHashCache<SystemType>
    {
        self.factory.file_hashes()
    }

    /*  Symlinks in the last-output tree point at the gen tree copies
        of the most recent build.  Failing to place one never fails the
        build. */
    fn refresh_last_links(&mut self, target : &BuildTarget, outputs : &Vec<String>)
    {
        let last_dir = self.layout.last_dir(target);
        match self.system.create_dir_all(&last_dir)
        {
            Ok(()) => {},
            Err(_error) => return,
        }

        for output in outputs
        {
            let link = format!("{}/{}", last_dir, file_name_of(output));
            match self.system.symlink(output, &link)
            {
                Ok(()) => {},
                Err(_error) => {},
            }
        }
    }

    fn materialize(
        &mut self,
        target : &BuildTarget,
        bundle : &Bundle) -> Result<(), String>
    {
        match bundle.materialize(&mut self.system)
        {
            Ok(()) => {},
            Err(error) => return Err(format!("artifact failed to materialize: {}", error)),
        }

        let mut outputs = vec![];
        for file in &bundle.files
        {
            self.file_hashes().invalidate(&file.path);
            outputs.push(file.path.clone());
        }
        self.refresh_last_links(target, &outputs);
        Ok(())
    }

    fn probe(
        &mut self,
        target : &BuildTarget,
        key : &Fingerprint) -> Option<Result<CacheSource, String>>
    {
        match self.cache.fetch(key)
        {
            CacheResult::Hit{source, bundle, ..} =>
            {
                match self.materialize(target, &bundle)
                {
                    Ok(()) => Some(Ok(source)),
                    Err(message) => Some(Err(message)),
                }
            },
            CacheResult::Miss => None,
            CacheResult::Ignored => None,
            CacheResult::Error(error) =>
            {
                self.bus.post(BuildEvent::CacheTrouble
                {
                    target : target.clone(),
                    message : format!("{}", error),
                });
                None
            },
        }
    }

    /*  The first pass over a rule: compute its default key, probe the
        cache, and either finish on a hit or hand the coordinator the
        list of deps to wait for. */
    fn run_start(&mut self, target : &BuildTarget) -> ReportBody
    {
        if self.cancel.load(Ordering::SeqCst)
        {
            return ReportBody::Canceled;
        }

        let rule =
        match self.builder.require_rule(target)
        {
            Ok(rule) => rule,
            Err(error) => return ReportBody::Infra(format!("{}", error)),
        };

        let default_key =
        match self.factory.compute(&self.builder, &rule, KeyKind::Default)
        {
            Ok(key) => key,
            Err(error) => return ReportBody::Infra(format!("{}", error)),
        };

        if !self.options.populate_cache_only
        {
            match self.probe(target, &default_key)
            {
                Some(Ok(source)) => return ReportBody::Hit(source),
                Some(Err(message)) => return ReportBody::Infra(message),
                None => {},
            }
        }

        ReportBody::NeedsDeps
        {
            deps : rule.build_deps.clone(),
            default_key : Some(default_key),
        }
    }

    /*  The second pass, entered once every build dep is done: try the
        default key again (coalesced rules land here), then the
        input-based key, then run the steps and upload. */
    fn run_resume(&mut self, target : &BuildTarget) -> ReportBody
    {
        if self.cancel.load(Ordering::SeqCst)
        {
            return ReportBody::Canceled;
        }

        let rule =
        match self.builder.require_rule(target)
        {
            Ok(rule) => rule,
            Err(error) => return ReportBody::Infra(format!("{}", error)),
        };

        let default_key =
        match self.factory.compute(&self.builder, &rule, KeyKind::Default)
        {
            Ok(key) => key,
            Err(error) => return ReportBody::Infra(format!("{}", error)),
        };

        if !self.options.populate_cache_only
        {
            match self.probe(target, &default_key)
            {
                Some(Ok(source)) => return ReportBody::Hit(source),
                Some(Err(message)) => return ReportBody::Infra(message),
                None => {},
            }

            if rule.supports_input_key
            {
                match self.factory.compute(&self.builder, &rule, KeyKind::InputBased)
                {
                    Ok(input_key) =>
                    {
                        match self.cache.fetch(&input_key)
                        {
                            CacheResult::Hit{source, metadata, bundle} =>
                            {
                                match self.materialize(target, &bundle)
                                {
                                    Ok(()) => {},
                                    Err(message) => return ReportBody::Infra(message),
                                }

                                /*  An input-based hit is worth
                                    remembering under the default key
                                    too. */
                                match self.cache.store(&default_key, &metadata, &bundle)
                                {
                                    Ok(()) => {},
                                    Err(error) =>
                                    {
                                        self.bus.post(BuildEvent::CacheTrouble
                                        {
                                            target : target.clone(),
                                            message : format!("{}", error),
                                        });
                                    },
                                }
                                return ReportBody::Hit(source);
                            },
                            CacheResult::Miss => {},
                            CacheResult::Ignored => {},
                            CacheResult::Error(error) =>
                            {
                                self.bus.post(BuildEvent::CacheTrouble
                                {
                                    target : target.clone(),
                                    message : format!("{}", error),
                                });
                            },
                        }
                    },
                    Err(KeyError::DepOutputsMissing(_dep)) => {},
                    Err(error) => return ReportBody::Infra(format!("{}", error)),
                }
            }
        }

        /*  Local build. */
        for step in &rule.steps
        {
            if self.cancel.load(Ordering::SeqCst)
            {
                return ReportBody::Canceled;
            }
            match self.run_step(step)
            {
                Ok(()) => {},
                Err(body) => return body,
            }
        }

        for output in &rule.outputs
        {
            if !self.system.is_file(output)
            {
                return ReportBody::StepFailed(
                    format!("build steps did not produce the declared output: {}", output));
            }
            self.file_hashes().invalidate(output);
        }

        let bundle =
        match Bundle::gather(&self.system, &rule.outputs)
        {
            Ok(bundle) => bundle,
            Err(error) => return ReportBody::Infra(
                format!("outputs failed to read for upload: {}", error)),
        };

        let metadata = ArtifactMetadata
        {
            origin : self.options.origin.clone(),
            content_hash : bundle.fingerprint(),
        };

        self.upload(target, &rule, &default_key, &metadata, &bundle);
        self.refresh_last_links(target, &rule.outputs);

        ReportBody::Built
    }

    /*  A successful build uploads under the default key and every
        supported secondary key.  Upload trouble degrades, never
        fails the rule. */
    fn upload(
        &mut self,
        target : &BuildTarget,
        rule : &Arc<BuildRule>,
        default_key : &Fingerprint,
        metadata : &ArtifactMetadata,
        bundle : &Bundle)
    {
        match self.cache.store(default_key, metadata, bundle)
        {
            Ok(()) => {},
            Err(error) =>
            {
                self.bus.post(BuildEvent::CacheTrouble
                {
                    target : target.clone(),
                    message : format!("{}", error),
                });
            },
        }

        if rule.supports_input_key
        {
            match self.factory.compute(&self.builder, rule, KeyKind::InputBased)
            {
                Ok(input_key) =>
                {
                    match self.cache.store(&input_key, metadata, bundle)
                    {
                        Ok(()) => {},
                        Err(error) =>
                        {
                            self.bus.post(BuildEvent::CacheTrouble
                            {
                                target : target.clone(),
                                message : format!("{}", error),
                            });
                        },
                    }
                },
                Err(_error) => {},
            }
        }
    }

    fn run_step(&mut self, step : &Step) -> Result<(), ReportBody>
    {
        match step
        {
            Step::MakeDirs(path) =>
            {
                match self.system.create_dir_all(path)
                {
                    Ok(()) => Ok(()),
                    Err(error) => Err(ReportBody::Infra(
                        format!("failed to create directory {}: {}", path, error))),
                }
            },

            Step::WriteFile{path, content} =>
            {
                match write_file(&mut self.system, path, content.as_bytes())
                {
                    Ok(()) => Ok(()),
                    Err(error) => Err(ReportBody::Infra(
                        format!("failed to write {}: {}", path, error))),
                }
            },

            Step::Copy{from, to} =>
            {
                let content =
                match read_file(&self.system, from)
                {
                    Ok(content) => content,
                    Err(error) => return Err(ReportBody::StepFailed(
                        format!("failed to read {}: {}", from, error))),
                };
                match write_file(&mut self.system, to, &content)
                {
                    Ok(()) => Ok(()),
                    Err(error) => Err(ReportBody::Infra(
                        format!("failed to write {}: {}", to, error))),
                }
            },

            Step::Run(argv) =>
            {
                let timeout = self.options.step_timeout_ms;
                match self.system.execute_command(argv.clone(), timeout)
                {
                    Ok(output) =>
                    {
                        if output.success
                        {
                            Ok(())
                        }
                        else
                        {
                            Err(ReportBody::StepFailed(format!(
                                "step exited with {}: {}",
                                match output.code
                                {
                                    Some(code) => format!("{}", code),
                                    None => "no status".to_string(),
                                },
                                output.err)))
                        }
                    },
                    Err(error) => Err(ReportBody::StepFailed(format!("{}", error))),
                }
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum RuleState
{
    Running,
    Waiting,
    Parked,
    Done(RuleOutcome),
}

struct RuleInfo
{
    state : RuleState,
    dependents : Vec<BuildTarget>,
    deps_remaining : usize,
    suspended : bool,
    default_key : Option<Fingerprint>,
}

struct Coordinator
{
    infos : HashMap<BuildTarget, RuleInfo>,
    executing_keys : HashMap<Fingerprint, Vec<BuildTarget>>,
    outstanding : usize,
    job_sender : mpsc::Sender<Job>,
    bus : EventBus,
    cancel : Arc<AtomicBool>,
    keep_going : bool,
}

impl Coordinator
{
    fn dispatch_start(&mut self, target : &BuildTarget) -> Result<(), EngineError>
    {
        if self.infos.contains_key(target)
        {
            return Ok(());
        }

        self.infos.insert(target.clone(), RuleInfo
        {
            state : RuleState::Running,
            dependents : vec![],
            deps_remaining : 0,
            suspended : false,
            default_key : None,
        });

        self.bus.post(BuildEvent::RuleStarted{target : target.clone()});
        self.outstanding += 1;
        match self.job_sender.send(Job::Start(target.clone()))
        {
            Ok(()) => Ok(()),
            Err(_error) => Err(EngineError::Internal("worker pool is gone".to_string())),
        }
    }

    /*  At-most-once execution per rule key: the first rule with a key
        runs, later ones park and re-probe when the owner finishes. */
    fn dispatch_resume(&mut self, target : &BuildTarget) -> Result<(), EngineError>
    {
        let key = self.infos.get(target).and_then(|info| info.default_key);
        match key
        {
            Some(key) =>
            {
                match self.executing_keys.get_mut(&key)
                {
                    Some(followers) =>
                    {
                        followers.push(target.clone());
                        self.infos.get_mut(target).unwrap().state = RuleState::Parked;
                        return Ok(());
                    },
                    None =>
                    {
                        self.executing_keys.insert(key, vec![]);
                    },
                }
            },
            None => {},
        }

        let info = self.infos.get_mut(target).unwrap();
        if info.suspended
        {
            self.bus.post(BuildEvent::RuleResumed{target : target.clone()});
        }
        info.state = RuleState::Running;
        self.outstanding += 1;
        match self.job_sender.send(Job::Resume(target.clone()))
        {
            Ok(()) => Ok(()),
            Err(_error) => Err(EngineError::Internal("worker pool is gone".to_string())),
        }
    }

    fn release_key(&mut self, target : &BuildTarget) -> Result<(), EngineError>
    {
        let key =
        match self.infos.get(target).and_then(|info| info.default_key)
        {
            Some(key) => key,
            None => return Ok(()),
        };

        let followers =
        match self.executing_keys.remove(&key)
        {
            Some(followers) => followers,
            None => return Ok(()),
        };

        for follower in followers
        {
            let parked =
            match self.infos.get(&follower)
            {
                Some(info) => info.state == RuleState::Parked,
                None => false,
            };
            if parked
            {
                self.dispatch_resume(&follower)?;
            }
        }
        Ok(())
    }

    fn finish(
        &mut self,
        target : &BuildTarget,
        outcome : RuleOutcome) -> Result<(), EngineError>
    {
        self.release_key(target)?;

        let dependents =
        {
            let info = self.infos.get_mut(target).unwrap();
            info.state = RuleState::Done(outcome.clone());
            info.dependents.clone()
        };

        self.bus.post(BuildEvent::RuleFinished
        {
            target : target.clone(),
            outcome : outcome.clone(),
        });

        let succeeded =
        match outcome
        {
            RuleOutcome::Built | RuleOutcome::CacheHit(_) => true,
            _ => false,
        };

        if succeeded
        {
            for dependent in dependents
            {
                let ready =
                {
                    let info = self.infos.get_mut(&dependent).unwrap();
                    info.deps_remaining -= 1;
                    info.deps_remaining == 0 && info.state == RuleState::Waiting
                };
                if ready
                {
                    self.dispatch_resume(&dependent)?;
                }
            }
        }
        else
        {
            self.cancel_dependents(target)?;
            match outcome
            {
                RuleOutcome::Failed(_) =>
                {
                    if !self.keep_going
                    {
                        self.cancel.store(true, Ordering::SeqCst);
                        self.cancel_idle_rules()?;
                    }
                },
                _ => {},
            }
        }

        Ok(())
    }

    /*  Marks every waiting or parked dependent subtree canceled.
        Rules with a job in flight report back on their own. */
    fn cancel_dependents(&mut self, target : &BuildTarget) -> Result<(), EngineError>
    {
        let mut pending =
        match self.infos.get(target)
        {
            Some(info) => info.dependents.clone(),
            None => vec![],
        };

        while let Some(current) = pending.pop()
        {
            let cancelable =
            match self.infos.get(&current)
            {
                Some(info) =>
                    info.state == RuleState::Waiting || info.state == RuleState::Parked,
                None => false,
            };

            if !cancelable
            {
                continue;
            }

            self.finish_canceled(&current)?;
            match self.infos.get(&current)
            {
                Some(info) =>
                {
                    for dependent in &info.dependents
                    {
                        pending.push(dependent.clone());
                    }
                },
                None => {},
            }
        }
        Ok(())
    }

    fn cancel_idle_rules(&mut self) -> Result<(), EngineError>
    {
        let idle : Vec<BuildTarget> = self.infos
            .iter()
            .filter(|(_target, info)|
                info.state == RuleState::Waiting || info.state == RuleState::Parked)
            .map(|(target, _info)| target.clone())
            .collect();
        for target in idle
        {
            self.finish_canceled(&target)?;
        }
        Ok(())
    }

    fn finish_canceled(&mut self, target : &BuildTarget) -> Result<(), EngineError>
    {
        let suspended =
        {
            let info = self.infos.get_mut(target).unwrap();
            info.suspended
        };

        /*  Keep the per-rule event sequence well formed: a suspended
            rule resumes before it finishes. */
        if suspended
        {
            self.bus.post(BuildEvent::RuleResumed{target : target.clone()});
            self.infos.get_mut(target).unwrap().suspended = false;
        }

        self.release_key(target)?;

        {
            let info = self.infos.get_mut(target).unwrap();
            info.state = RuleState::Done(RuleOutcome::Canceled);
        }
        self.bus.post(BuildEvent::RuleFinished
        {
            target : target.clone(),
            outcome : RuleOutcome::Canceled,
        });
        Ok(())
    }

    fn handle_needs_deps(
        &mut self,
        target : &BuildTarget,
        deps : Vec<BuildTarget>,
        default_key : Option<Fingerprint>) -> Result<(), EngineError>
    {
        self.infos.get_mut(target).unwrap().default_key = default_key;

        let mut remaining = 0;
        let mut doomed = false;
        for dep in &deps
        {
            let dep_state = self.infos.get(dep).map(|info| info.state.clone());
            match dep_state
            {
                Some(RuleState::Done(RuleOutcome::Built))
                | Some(RuleState::Done(RuleOutcome::CacheHit(_))) => {},

                Some(RuleState::Done(_)) =>
                {
                    doomed = true;
                },

                Some(_) =>
                {
                    remaining += 1;
                    self.infos.get_mut(dep).unwrap().dependents.push(target.clone());
                },

                None =>
                {
                    remaining += 1;
                    self.dispatch_start(dep)?;
                    self.infos.get_mut(dep).unwrap().dependents.push(target.clone());
                },
            }
        }

        if doomed
        {
            self.finish_canceled(target)?;
            self.cancel_dependents(target)?;
            return Ok(());
        }

        let info = self.infos.get_mut(target).unwrap();
        info.deps_remaining = remaining;
        if remaining == 0
        {
            self.dispatch_resume(target)
        }
        else
        {
            info.state = RuleState::Waiting;
            info.suspended = true;
            self.bus.post(BuildEvent::RuleSuspended{target : target.clone()});
            Ok(())
        }
    }
}

/*  Executes the root rules: dependency-ordered, cache-first, bounded
    by the worker pool.  Rule completions drive dependents; nothing
    polls. */
pub fn execute<SystemType : System + 'static>(
    system : &SystemType,
    builder : Arc<ActionGraphBuilder>,
    factory : Arc<RuleKeyFactory<SystemType>>,
    cache : Arc<dyn ArtifactCache>,
    bus : &EventBus,
    roots : &Vec<BuildTarget>,
    options : EngineOptions,
    cancel : Arc<AtomicBool>) -> Result<BuildOutcome, EngineError>
{
    let (job_sender, job_receiver) = mpsc::channel::<Job>();
    let job_receiver = Arc::new(Mutex::new(job_receiver));
    let (report_sender, report_receiver) = mpsc::channel::<Report>();

    let worker_count = if options.jobs == 0 { 1 } else { options.jobs };
    let layout = builder.source_path_resolver().layout.clone();

    let mut workers = vec![];
    for _ in 0..worker_count
    {
        let jobs = job_receiver.clone();
        let reports = report_sender.clone();
        let mut context = WorkerContext
        {
            system : system.clone(),
            builder : builder.clone(),
            factory : factory.clone(),
            cache : cache.clone(),
            bus : bus.clone(),
            options : options.clone(),
            cancel : cancel.clone(),
            layout : layout.clone(),
        };

        workers.push(thread::spawn(
            move ||
            {
                loop
                {
                    let job =
                    {
                        let guard = jobs.lock().unwrap();
                        guard.recv()
                    };

                    match job
                    {
                        Ok(Job::Start(target)) =>
                        {
                            let body = context.run_start(&target);
                            match reports.send(Report{target : target, body : body})
                            {
                                Ok(()) => {},
                                Err(_error) => return,
                            }
                        },
                        Ok(Job::Resume(target)) =>
                        {
                            let body = context.run_resume(&target);
                            match reports.send(Report{target : target, body : body})
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
    drop(report_sender);

    let mut coordinator = Coordinator
    {
        infos : HashMap::new(),
        executing_keys : HashMap::new(),
        outstanding : 0,
        job_sender : job_sender,
        bus : bus.clone(),
        cancel : cancel,
        keep_going : options.keep_going,
    };

    let outcome = run_schedule(&mut coordinator, &report_receiver, roots);

    drop(coordinator);
    drop(report_receiver);
    for worker in workers
    {
        let _ = worker.join();
    }

    outcome
}

fn run_schedule(
    coordinator : &mut Coordinator,
    report_receiver : &mpsc::Receiver<Report>,
    roots : &Vec<BuildTarget>) -> Result<BuildOutcome, EngineError>
{
    for root in roots
    {
        coordinator.dispatch_start(root)?;
    }

    while coordinator.outstanding > 0
    {
        let report =
        match report_receiver.recv()
        {
            Ok(report) => report,
            Err(_error) => return Err(EngineError::Internal(
                "engine workers disappeared".to_string())),
        };

        coordinator.outstanding -= 1;

        match report.body
        {
            ReportBody::Hit(source) =>
                coordinator.finish(&report.target, RuleOutcome::CacheHit(source))?,

            ReportBody::Built =>
                coordinator.finish(&report.target, RuleOutcome::Built)?,

            ReportBody::NeedsDeps{deps, default_key} =>
                coordinator.handle_needs_deps(&report.target, deps, default_key)?,

            ReportBody::StepFailed(message) =>
                coordinator.finish(&report.target, RuleOutcome::Failed(message))?,

            ReportBody::Infra(message) =>
                coordinator.finish(&report.target, RuleOutcome::Failed(message))?,

            ReportBody::Canceled =>
                coordinator.finish(&report.target, RuleOutcome::Canceled)?,
        }
    }

    /*  With no jobs in flight, nothing left can make progress.  Any
        straggler still waiting is canceled rather than silently
        dropped. */
    let stragglers : Vec<BuildTarget> = coordinator.infos
        .iter()
        .filter(|(_target, info)|
            match info.state
            {
                RuleState::Done(_) => false,
                _ => true,
            })
        .map(|(target, _info)| target.clone())
        .collect();
    for straggler in stragglers
    {
        coordinator.finish_canceled(&straggler)?;
    }

    let mut results = BTreeMap::new();
    for (target, info) in &coordinator.infos
    {
        match &info.state
        {
            RuleState::Done(outcome) =>
            {
                results.insert(target.clone(), outcome.clone());
            },
            _ => {},
        }
    }

    let mut success = true;
    for root in roots
    {
        match results.get(root)
        {
            Some(RuleOutcome::Built) | Some(RuleOutcome::CacheHit(_)) => {},
            _ => success = false,
        }
    }

    Ok(BuildOutcome
    {
        results : results,
        success : success,
    })
}
