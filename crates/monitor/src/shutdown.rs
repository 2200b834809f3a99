use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Finish in-flight probes, then exit.
    Graceful,
    /// Exit now.
    Immediate,
}

/// Listen for ctrl-c. The first interrupt asks for a graceful stop, any
/// further one demands an immediate exit.
pub fn spawn_signal_listener() -> mpsc::UnboundedReceiver<ShutdownSignal> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut interrupts: u32 = 0;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            interrupts += 1;
            let signal = if interrupts == 1 {
                ShutdownSignal::Graceful
            } else {
                ShutdownSignal::Immediate
            };
            if tx.send(signal).is_err() || signal == ShutdownSignal::Immediate {
                return;
            }
        }
    });
    rx
}
