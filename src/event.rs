use crate::artifact::CacheSource;
use crate::target::BuildTarget;
use std::sync::
{
    Arc,
    Mutex,
};
use std::sync::atomic::
{
    AtomicUsize,
    Ordering,
};
use std::sync::mpsc;
use std::sync::mpsc::
{
    Receiver,
    SyncSender,
    TrySendError,
};

/*  How one rule ended. */
#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome
{
    Built,
    CacheHit(CacheSource),
    Failed(String),
    Canceled,
}

/*  The structured stream every non-success path surfaces on.  Each
    rule's lifecycle reads STARTED (SUSPENDED RESUMED)* FINISHED. */
#[derive(Debug, Clone, PartialEq)]
pub enum BuildEvent
{
    RuleStarted
    {
        target : BuildTarget,
    },
    RuleSuspended
    {
        target : BuildTarget,
    },
    RuleResumed
    {
        target : BuildTarget,
    },
    RuleFinished
    {
        target : BuildTarget,
        outcome : RuleOutcome,
    },
    CacheTrouble
    {
        target : BuildTarget,
        message : String,
    },
}

struct SubscriberSlot
{
    sender : SyncSender<BuildEvent>,
    drops : Arc<AtomicUsize>,
}

/*  A publisher that never blocks: each subscriber gets a bounded
    queue, and when the queue is full the event is counted as dropped
    instead of stalling the build.  Subscribers read their own drop
    counter and are expected to report it. */
#[derive(Clone)]
pub struct EventBus
{
    subscribers : Arc<Mutex<Vec<SubscriberSlot>>>,
}

pub struct Subscription
{
    receiver : Receiver<BuildEvent>,
    drops : Arc<AtomicUsize>,
}

impl Subscription
{
    /*  Everything queued so far, without blocking. */
    pub fn drain(&self) -> Vec<BuildEvent>
    {
        self.receiver.try_iter().collect()
    }

    /*  Blocks for the next event; None when the bus is gone. */
    pub fn next_event(&self) -> Option<BuildEvent>
    {
        self.receiver.recv().ok()
    }

    pub fn dropped(&self) -> usize
    {
        self.drops.load(Ordering::SeqCst)
    }
}

impl EventBus
{
    pub fn new() -> EventBus
    {
        EventBus
        {
            subscribers : Arc::new(Mutex::new(vec![])),
        }
    }

    pub fn subscribe(&self, capacity : usize) -> Subscription
    {
        let (sender, receiver) = mpsc::sync_channel(capacity);
        let drops = Arc::new(AtomicUsize::new(0));
        self.subscribers.lock().unwrap().push(SubscriberSlot
        {
            sender : sender,
            drops : drops.clone(),
        });
        Subscription
        {
            receiver : receiver,
            drops : drops,
        }
    }

    pub fn post(&self, event : BuildEvent)
    {
        let subscribers = self.subscribers.lock().unwrap();
        for slot in subscribers.iter()
        {
            match slot.sender.try_send(event.clone())
            {
                Ok(()) => {},
                Err(TrySendError::Full(_event)) =>
                {
                    slot.drops.fetch_add(1, Ordering::SeqCst);
                },
                Err(TrySendError::Disconnected(_event)) => {},
            }
        }
    }
}

#[cfg(test)]
mod test
{
    use crate::event::
    {
        BuildEvent,
        EventBus,
        RuleOutcome,
    };
    use crate::target::BuildTarget;

    fn started(name : &str) -> BuildEvent
    {
        BuildEvent::RuleStarted
        {
            target : BuildTarget::new("root", "pkg", name),
        }
    }

    #[test]
    fn events_reach_every_subscriber()
    {
        let bus = EventBus::new();
        let first = bus.subscribe(16);
        let second = bus.subscribe(16);

        bus.post(started("a"));
        bus.post(BuildEvent::RuleFinished
        {
            target : BuildTarget::new("root", "pkg", "a"),
            outcome : RuleOutcome::Built,
        });

        assert_eq!(first.drain().len(), 2);
        assert_eq!(second.drain().len(), 2);
        assert_eq!(first.dropped(), 0);
    }

    #[test]
    fn slow_subscriber_loses_events_instead_of_blocking()
    {
        let bus = EventBus::new();
        let slow = bus.subscribe(2);

        for index in 0..5
        {
            bus.post(started(&format!("rule{}", index)));
        }

        /*  The publisher never blocked; two events fit, three fell on
            the floor and were counted. */
        assert_eq!(slow.drain().len(), 2);
        assert_eq!(slow.dropped(), 3);
    }

    #[test]
    fn dropped_subscriber_does_not_break_the_bus()
    {
        let bus = EventBus::new();
        let ephemeral = bus.subscribe(2);
        drop(ephemeral);

        let live = bus.subscribe(8);
        bus.post(started("a"));
        assert_eq!(live.drain().len(), 1);
    }
}
