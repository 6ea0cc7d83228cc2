use std::{
    sync::mpsc::{self, RecvTimeoutError, Sender},
    thread::{self, JoinHandle},
    time::Duration,
};

use super::{InterruptHandle, VmError};

/// What a finished injector did.
#[derive(Debug)]
pub enum InjectionOutcome {
    Delivered { vector: u32 },
    /// The hypervisor refused the interrupt. The vCPU is untouched.
    Rejected(VmError),
    /// Cancelled before the delay elapsed.
    Cancelled,
    /// The target vCPU was released before the delay elapsed.
    TargetGone,
}

impl InjectionOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, InjectionOutcome::Delivered { .. })
    }
}

/// One-shot delayed interrupt injection on a background thread.
///
/// On expiry the thread kicks the target out of `run` and queues the
/// vector. Dropping the injector cancels it and waits for the thread.
pub struct InterruptInjector {
    cancel: Option<Sender<()>>,
    thread: Option<JoinHandle<InjectionOutcome>>,
}

impl InterruptInjector {
    pub fn spawn(target: InterruptHandle, vector: u32, delay: Duration) -> std::io::Result<Self> {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let vcpu_id = target.vcpu_id();

        let thread = thread::Builder::new()
            .name(format!("vcpu{}-injector", vcpu_id))
            .spawn(move || match cancelled.recv_timeout(delay) {
                Err(RecvTimeoutError::Timeout) => fire(&target, vector),
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    log::info!("Interrupt injection cancelled");
                    InjectionOutcome::Cancelled
                }
            })?;

        log::debug!(
            "Injector armed: vector {} into vCPU {} in {:?}",
            vector,
            vcpu_id,
            delay
        );

        Ok(Self {
            cancel: Some(cancel),
            thread: Some(thread),
        })
    }

    /// Stops a pending injection and waits for the thread. An injection that
    /// already fired reports its real outcome.
    pub fn cancel(mut self) -> InjectionOutcome {
        if let Some(cancel) = self.cancel.take() {
            // The thread may have finished already and dropped its receiver.
            let _ = cancel.send(());
        }

        self.wait()
    }

    /// Waits for the injection to fire.
    pub fn join(mut self) -> InjectionOutcome {
        self.wait()
    }

    fn wait(&mut self) -> InjectionOutcome {
        let outcome = match self.thread.take() {
            Some(thread) => thread.join().unwrap_or_else(|_| {
                log::error!("Interrupt injector panicked");
                InjectionOutcome::Cancelled
            }),
            None => InjectionOutcome::Cancelled,
        };
        // Keep the sender until the thread is gone so `join` never reads a
        // disconnect as a cancellation.
        self.cancel = None;

        outcome
    }
}

impl Drop for InterruptInjector {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if self.thread.is_some() {
            self.wait();
        }
    }
}

fn fire(target: &InterruptHandle, vector: u32) -> InjectionOutcome {
    let Some(line) = target.upgrade() else {
        log::warn!("vCPU {} is gone, interrupt not sent", target.vcpu_id());
        return InjectionOutcome::TargetGone;
    };

    log::info!("Sending interrupt {} to vCPU {}", vector, target.vcpu_id());
    line.kick();

    match line.inject(vector) {
        Ok(()) => {
            log::info!("Interrupted successfully");
            InjectionOutcome::Delivered { vector }
        }
        Err(err) => {
            log::warn!("KVM_INTERRUPT failed: {}", err);
            InjectionOutcome::Rejected(err)
        }
    }
}
