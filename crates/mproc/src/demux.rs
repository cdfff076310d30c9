//! Response demultiplexer: one thread draining the context response ring
//! and waking the caller each result belongs to.

use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};

use crate::bridge::codec::WireCodec;
use crate::bridge::protocol::ContextResult;
use crate::context::WaitTable;
use crate::lifecycle::ServerEvent;
use crate::ring::{RingConsumer, RingError};

pub(crate) fn spawn(
    responses: Arc<RingConsumer>,
    table: Arc<WaitTable>,
    events: Sender<ServerEvent>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("mproc-demux".to_string())
        .spawn(move || run(&responses, &table, &events))
}

fn run(responses: &RingConsumer, table: &WaitTable, events: &Sender<ServerEvent>) {
    let codec = WireCodec::<ContextResult>::new();
    tracing::debug!(channel = responses.ring().id(), "Response demultiplexer started");

    loop {
        let bytes = match responses.pop() {
            Ok(bytes) => bytes,
            Err(RingError::Closed) => {
                if !table.is_closed() {
                    let _ = events.send(ServerEvent::StopRequested {
                        reason: "context response channel closed".to_string(),
                    });
                }
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "Context response channel failed");
                let _ = events.send(ServerEvent::Fatal {
                    error: e.to_string(),
                });
                break;
            }
        };

        let result = match codec.decode(&bytes) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable context result");
                continue;
            }
        };

        let (id, kind) = (result.id, result.reply.kind());
        if !table.deliver(id, result.reply) {
            // Usually a reply that arrived after its caller timed out.
            tracing::warn!(id = %id, reply = kind, "Dropping context result for unknown call");
        }
    }

    let cancelled = table.close_and_cancel();
    tracing::debug!(cancelled, "Response demultiplexer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{CorrelationId, Reply};
    use crate::ring::{self, RingProducer};
    use std::sync::mpsc;

    fn push(tx: &RingProducer, id: CorrelationId, reply: Reply) {
        let bytes = WireCodec::new().encode(&ContextResult { id, reply }).unwrap();
        tx.push(&bytes).unwrap();
    }

    #[test]
    fn routes_results_and_survives_bad_frames() {
        let (tx, rx) = ring::pair(4096).unwrap();
        let table = Arc::new(WaitTable::new(8));
        let (events_tx, events_rx) = mpsc::channel();
        let handle = spawn(Arc::new(rx), Arc::clone(&table), events_tx).unwrap();

        let (a, ra) = table.register().unwrap();
        let (b, rb) = table.register().unwrap();

        tx.push(b"not bincode").unwrap();
        push(&tx, CorrelationId::new(10_000), Reply::NotFound);
        push(&tx, b, Reply::Size(3));
        push(&tx, a, Reply::Triggered);

        assert_eq!(ra.recv().unwrap(), Reply::Triggered);
        assert_eq!(rb.recv().unwrap(), Reply::Size(3));

        // Once the table is closed the demux treats the close as expected.
        table.close_and_cancel();
        tx.close();
        handle.join().unwrap();
        assert!(events_rx.try_recv().is_err());
    }

    #[test]
    fn host_close_cancels_waiters_and_requests_stop() {
        let (tx, rx) = ring::pair(4096).unwrap();
        let table = Arc::new(WaitTable::new(8));
        let (events_tx, events_rx) = mpsc::channel();
        let handle = spawn(Arc::new(rx), Arc::clone(&table), events_tx).unwrap();

        let waiters: Vec<_> = (0..3).map(|_| table.register().unwrap().1).collect();
        tx.close();
        handle.join().unwrap();

        for rx in waiters {
            assert_eq!(rx.recv().unwrap(), Reply::Cancelled);
        }
        assert!(table.is_closed());
        assert!(matches!(
            events_rx.recv().unwrap(),
            ServerEvent::StopRequested { .. }
        ));
    }
}
