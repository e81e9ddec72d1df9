use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::{ready, Stream, StreamExt};
use nix::unistd::{getppid, Pid};
use tokio::{
    signal::unix::{signal, SignalKind},
    time::{interval, Interval, MissedTickBehavior},
};
use tokio_stream::wrappers::SignalStream;

const PARENT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What a trigger asks of the process that watches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    Restart,
    Terminate,
}

/// Anything that can make a supervisor or worker restart or stop.
pub(crate) enum Trigger {
    Signal(SignalKind, SignalStream),
    /// Fires once the process has been reparented away from `Pid`.
    ParentGone(Pid, Interval),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TriggerReason {
    Signal(SignalKind),
    ParentGone(Pid),
}

impl Trigger {
    pub(crate) fn signal(kind: SignalKind) -> io::Result<Self> {
        Ok(Self::Signal(kind, SignalStream::new(signal(kind)?)))
    }

    pub(crate) fn parent_gone() -> Self {
        let mut ticker = interval(PARENT_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self::ParentGone(getppid(), ticker)
    }
}

impl Stream for Trigger {
    type Item = TriggerReason;

    /// Never yields `None`.
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut() {
            Self::Signal(kind, signal_stream) => match ready!(signal_stream.poll_next_unpin(cx)) {
                None => unreachable!(), // SignalStream is documented to be infinite.
                Some(()) => Poll::Ready(Some(TriggerReason::Signal(*kind))),
            },
            Self::ParentGone(parent, ticker) => loop {
                ready!(ticker.poll_tick(cx));
                if getppid() != *parent {
                    return Poll::Ready(Some(TriggerReason::ParentGone(*parent)));
                }
            },
        }
    }
}

/// A set of triggers, each mapped to the action it requests.
pub(crate) struct Triggers(Vec<(Trigger, Action)>);

impl Triggers {
    /// The restart signal plus `SIGTERM` and `SIGINT` for termination. With `no_restart`, the
    /// restart signal terminates too.
    pub(crate) fn standard(restart_signal: SignalKind, no_restart: bool) -> io::Result<Self> {
        let restart = if no_restart {
            Action::Terminate
        } else {
            Action::Restart
        };
        Ok(Self(vec![
            (Trigger::signal(restart_signal)?, restart),
            (Trigger::signal(SignalKind::terminate())?, Action::Terminate),
            (Trigger::signal(SignalKind::interrupt())?, Action::Terminate),
        ]))
    }

    pub(crate) fn push(&mut self, trigger: Trigger, action: Action) {
        self.0.push((trigger, action));
    }

    pub(crate) async fn next(&mut self) -> (TriggerReason, Action) {
        fn poll_triggers(
            triggers: &mut [(Trigger, Action)],
            cx: &mut Context,
        ) -> Poll<(TriggerReason, Action)> {
            for (trigger, action) in triggers {
                match trigger.poll_next_unpin(cx) {
                    Poll::Ready(Some(reason)) => return Poll::Ready((reason, *action)),
                    Poll::Ready(None) => unreachable!(), // triggers are infinite streams
                    Poll::Pending => (),
                }
            }
            Poll::Pending
        }

        std::future::poll_fn(|cx| poll_triggers(&mut self.0, cx)).await
    }
}
