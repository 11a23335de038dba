use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use aero_mcu::{McuChannel, McuCommand, McuError, McuHeader, McuQuery, McuResponse, McuTransport};
use pretty_assertions::assert_eq;

struct QueueTransport(Sender<Vec<u8>>);

impl McuTransport for QueueTransport {
    fn transmit(&mut self, frame: Vec<u8>) -> Result<(), String> {
        self.0.send(frame).map_err(|err| err.to_string())
    }
}

/// Minimal firmware: answers every command that is not `Direct(0)` by echoing the payload
/// reversed. `Ext` commands are answered twice, first with a bogus sequence number.
fn spawn_firmware(
    channel: Weak<McuChannel<QueueTransport>>,
    rx: Receiver<Vec<u8>>,
) -> thread::JoinHandle<usize> {
    thread::spawn(move || {
        let mut handled = 0;
        for frame in rx {
            let Some(channel) = channel.upgrade() else {
                break;
            };
            let (header, payload) = McuHeader::decode(&frame).unwrap();
            handled += 1;
            if header.command == McuCommand::Direct(0) {
                continue;
            }
            if let McuCommand::Ext(_) = header.command {
                assert_eq!(header.ext_cid_ack(), header.query != McuQuery::NotApplicable);
                let bogus = McuResponse::new(header.seq % 15 + 1, vec![0xff]);
                channel.deliver_frame(&bogus.encode().unwrap()).unwrap();
            }
            let mut reply = payload.to_vec();
            reply.reverse();
            let response = McuResponse::new(header.seq, reply);
            channel.deliver_frame(&response.encode().unwrap()).unwrap();
        }
        handled
    })
}

fn loopback(timeout: Duration) -> (Arc<McuChannel<QueueTransport>>, thread::JoinHandle<usize>) {
    let (tx, rx) = mpsc::channel();
    let channel = Arc::new(McuChannel::with_timeout(QueueTransport(tx), timeout));
    let firmware = spawn_firmware(Arc::downgrade(&channel), rx);
    (channel, firmware)
}

fn shutdown(channel: Arc<McuChannel<QueueTransport>>, firmware: thread::JoinHandle<usize>) -> usize {
    // Dropping the last channel handle closes the queue and stops the firmware thread.
    drop(channel);
    firmware.join().unwrap()
}

#[test]
fn commands_get_their_own_responses() {
    let (channel, firmware) = loopback(Duration::from_secs(3));

    assert_eq!(
        channel.send(McuCommand::Direct(7), &[1, 2, 3], true),
        Ok(Some(vec![3, 2, 1]))
    );
    assert_eq!(
        channel.send_with_query(McuCommand::Ext(0x11), McuQuery::Set, b"ab", true),
        Ok(Some(b"ba".to_vec()))
    );
    assert_eq!(channel.send(McuCommand::Direct(0), &[9], false), Ok(None));
    assert!(!channel.is_hung());
    assert_eq!(shutdown(channel, firmware), 3);
}

#[test]
fn concurrent_senders_are_serialised() {
    let (channel, firmware) = loopback(Duration::from_secs(3));

    let senders: Vec<_> = (0u8..4)
        .map(|id| {
            let channel = Arc::clone(&channel);
            thread::spawn(move || {
                for i in 0u8..25 {
                    let command = if i % 2 == 0 {
                        McuCommand::Direct(1)
                    } else {
                        McuCommand::Ext(2)
                    };
                    let reply = channel.send(command, &[id, i], true).unwrap();
                    assert_eq!(reply, Some(vec![i, id]));
                }
            })
        })
        .collect();
    for sender in senders {
        sender.join().unwrap();
    }

    assert!(!channel.is_hung());
    assert_eq!(shutdown(channel, firmware), 100);
}

#[test]
fn unanswered_command_times_out_and_channel_recovers() {
    let (channel, firmware) = loopback(Duration::from_millis(200));

    assert_eq!(
        channel.send(McuCommand::Direct(0), &[], true),
        Err(McuError::Timeout)
    );
    assert!(channel.is_hung());

    // The next command still works once the hang is acknowledged.
    assert!(channel.clear_hang());
    assert_eq!(
        channel.send(McuCommand::Direct(5), &[4, 5], true),
        Ok(Some(vec![5, 4]))
    );
    assert_eq!(shutdown(channel, firmware), 2);
}
