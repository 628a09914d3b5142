//! HiSLIP engine tests against an in-process dual-channel mock instrument.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;

use visa_pure::enums::attribute::{AttrKind, Attribute};
use visa_pure::enums::status::{CompletionCode, ErrorCode};
use visa_pure::flags::AccessMode;
use visa_pure::protocol::hislip::{Header, MessageType, HEADER_SIZE};
use visa_pure::ResourceManager;

const SESSION_ID: u16 = 0xCAFE;

fn init_logger() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

fn send_msg(sock: &mut TcpStream, msg_type: MessageType, control: u8, parameter: u32, payload: &[u8]) {
    let header = Header {
        msg_type,
        control_code: control,
        message_parameter: parameter,
        payload_length: payload.len() as u64,
    };
    sock.write_all(&header.encode()).unwrap();
    sock.write_all(payload).unwrap();
}

fn read_msg(sock: &mut TcpStream) -> Option<(Header, Vec<u8>)> {
    let mut buf = [0u8; HEADER_SIZE];
    sock.read_exact(&mut buf).ok()?;
    let header = Header::decode(&buf).unwrap();
    let mut payload = vec![0u8; header.payload_length as usize];
    sock.read_exact(&mut payload).ok()?;
    Some((header, payload))
}

/// What the mock does with each complete client query.
enum SyncBehavior {
    /// Answer with a `DataEnd` echoing the query's message id.
    Respond(Vec<u8>),
    /// Swallow the query.
    Ignore,
    /// First answer with a stale message id, then correctly.
    StaleThenRespond(Vec<u8>),
}

struct MockInstrument {
    port: u16,
    /// Message ids of the `DataEnd` queries, in arrival order.
    ids: Arc<Mutex<Vec<u32>>>,
    handle: JoinHandle<()>,
}

impl MockInstrument {
    fn join(self) -> Vec<u32> {
        self.handle.join().unwrap();
        Arc::try_unwrap(self.ids).unwrap().into_inner().unwrap()
    }
}

fn spawn_instrument(behaviors: Vec<SyncBehavior>, srq_on_start: Option<u8>) -> MockInstrument {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let ids: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let ids_server = Arc::clone(&ids);

    let handle = thread::spawn(move || {
        // synchronous channel and Initialize
        let (mut sync, _) = listener.accept().unwrap();
        let (init, sub_address) = read_msg(&mut sync).unwrap();
        assert_eq!(init.msg_type, MessageType::Initialize);
        assert_eq!(sub_address, b"hislip0");
        let parameter = 0x0100_0000 | SESSION_ID as u32;
        send_msg(&mut sync, MessageType::InitializeResponse, 0, parameter, &[]);

        // asynchronous channel and AsyncInitialize
        let (mut async_sock, _) = listener.accept().unwrap();
        let (async_init, _) = read_msg(&mut async_sock).unwrap();
        assert_eq!(async_init.msg_type, MessageType::AsyncInitialize);
        assert_eq!(async_init.message_parameter, SESSION_ID as u32);
        send_msg(
            &mut async_sock,
            MessageType::AsyncInitializeResponse,
            0,
            u32::from_be_bytes(*b"MOCK"),
            &[],
        );
        if let Some(stb) = srq_on_start {
            send_msg(&mut async_sock, MessageType::AsyncServiceRequest, stb, 0, &[]);
        }

        // async channel servicing in its own thread
        let async_handler = thread::spawn(move || {
            while let Some((header, _payload)) = read_msg(&mut async_sock) {
                match header.msg_type {
                    MessageType::AsyncStatusQuery => {
                        send_msg(&mut async_sock, MessageType::AsyncStatusResponse, 0x44, 0, &[]);
                    }
                    MessageType::AsyncDeviceClear => {
                        send_msg(
                            &mut async_sock,
                            MessageType::AsyncDeviceClearAcknowledge,
                            0,
                            0,
                            &[],
                        );
                    }
                    MessageType::AsyncMaxMsgSize => {
                        send_msg(
                            &mut async_sock,
                            MessageType::AsyncMaxMsgSizeResponse,
                            0,
                            0,
                            &(1u64 << 20).to_be_bytes(),
                        );
                    }
                    other => panic!("unexpected async message {:?}", other),
                }
            }
        });

        // synchronous channel servicing
        let mut behaviors: VecDeque<SyncBehavior> = behaviors.into();
        let mut query: Vec<u8> = Vec::new();
        while let Some((header, payload)) = read_msg(&mut sync) {
            match header.msg_type {
                MessageType::Data => query.extend_from_slice(&payload),
                MessageType::DataEnd => {
                    query.extend_from_slice(&payload);
                    let id = header.message_parameter;
                    ids_server.lock().unwrap().push(id);
                    query.clear();
                    match behaviors.pop_front() {
                        Some(SyncBehavior::Respond(answer)) => {
                            send_msg(&mut sync, MessageType::DataEnd, 0, id, &answer);
                        }
                        Some(SyncBehavior::Ignore) | None => {}
                        Some(SyncBehavior::StaleThenRespond(answer)) => {
                            send_msg(
                                &mut sync,
                                MessageType::DataEnd,
                                0,
                                id.wrapping_sub(2),
                                b"STALE ANSWER",
                            );
                            send_msg(&mut sync, MessageType::DataEnd, 0, id, &answer);
                        }
                    }
                }
                MessageType::DeviceClearComplete => {
                    send_msg(&mut sync, MessageType::DeviceClearAcknowledge, 0, 0, &[]);
                }
                other => panic!("unexpected sync message {:?}", other),
            }
        }
        drop(async_handler);
    });

    MockInstrument { port, ids, handle }
}

fn open(rm: &ResourceManager, port: u16) -> visa_pure::Instrument {
    rm.open(
        &format!("TCPIP::127.0.0.1::hislip0,{}::INSTR", port),
        AccessMode::NO_LOCK,
        Duration::from_secs(2),
    )
    .unwrap()
}

/// Message ids start at 0xFFFF_FF00, stay even and advance by 2 per data
/// message; responses echo the id of the query they answer.
#[test]
fn message_ids_advance_by_two() -> Result<()> {
    init_logger();
    let mock = spawn_instrument(
        vec![
            SyncBehavior::Respond(b"MOCK,ONE\n".to_vec()),
            SyncBehavior::Respond(b"MOCK,TWO\n".to_vec()),
        ],
        None,
    );
    let rm = ResourceManager::new()?;
    let mut instr = open(&rm, mock.port);

    instr.write(b"*IDN?\n")?;
    let (first, status) = instr.read(64)?;
    assert_eq!(first, b"MOCK,ONE\n");
    assert_eq!(status, CompletionCode::Success);

    instr.write(b"*IDN?\n")?;
    let (second, _) = instr.read(64)?;
    assert_eq!(second, b"MOCK,TWO\n");

    instr.close().ok();
    let ids = mock.join();
    assert_eq!(ids, vec![0xFFFF_FF00, 0xFFFF_FF02]);
    assert!(ids.iter().all(|id| id % 2 == 0));
    Ok(())
}

/// After a read timeout the next write/read cycle completes, discarding the
/// stale-id message the instrument emits late.
#[test]
fn resynchronizes_after_read_timeout() -> Result<()> {
    init_logger();
    let mock = spawn_instrument(
        vec![
            SyncBehavior::Ignore,
            SyncBehavior::StaleThenRespond(b"IDN-OK\n".to_vec()),
        ],
        None,
    );
    let rm = ResourceManager::new()?;
    let mut instr = open(&rm, mock.port);
    instr.set_attr(Attribute::TmoValue(150))?;

    instr.write(b"*IDN?\n")?;
    let err = instr.read(64).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Tmo);

    instr.set_attr(Attribute::TmoValue(2000))?;
    instr.write(b"*IDN?\n")?;
    let (data, status) = instr.read(64)?;
    assert_eq!(data, b"IDN-OK\n");
    assert_eq!(status, CompletionCode::Success);

    instr.close().ok();
    mock.join();
    Ok(())
}

/// A server-initiated service request is queued by the async reader and
/// served by `read_stb` without a status query; once drained, `read_stb`
/// falls back to `AsyncStatusQuery`.
#[test]
fn service_requests_feed_read_stb() -> Result<()> {
    init_logger();
    let mock = spawn_instrument(vec![], Some(0x42));
    let rm = ResourceManager::new()?;
    let mut instr = open(&rm, mock.port);

    // give the async reader a moment to pick the SRQ up
    thread::sleep(Duration::from_millis(100));
    assert_eq!(instr.read_stb()?, 0x42);
    assert_eq!(instr.read_stb()?, 0x44);

    instr.close().ok();
    mock.join();
    Ok(())
}

/// Device clear restarts the message-id sequence.
#[test]
fn device_clear_restarts_message_ids() -> Result<()> {
    init_logger();
    let mock = spawn_instrument(
        vec![
            SyncBehavior::Respond(b"A\n".to_vec()),
            SyncBehavior::Respond(b"B\n".to_vec()),
        ],
        None,
    );
    let rm = ResourceManager::new()?;
    let mut instr = open(&rm, mock.port);

    instr.write(b"*IDN?\n")?;
    instr.read(64)?;
    instr.clear()?;
    instr.write(b"*IDN?\n")?;
    instr.read(64)?;

    instr.close().ok();
    let ids = mock.join();
    assert_eq!(ids, vec![0xFFFF_FF00, 0xFFFF_FF00]);
    Ok(())
}

/// Keepalive lands on the underlying sockets for HiSLIP sessions too.
#[test]
fn keepalive_attribute_round_trips() -> Result<()> {
    init_logger();
    let mock = spawn_instrument(vec![], None);
    let rm = ResourceManager::new()?;
    let mut instr = open(&rm, mock.port);

    instr.set_attr(Attribute::TcpipKeepalive(true))?;
    assert_eq!(
        instr.get_attr(AttrKind::TcpipKeepalive)?,
        Attribute::TcpipKeepalive(true)
    );
    assert_eq!(
        instr.get_attr(AttrKind::TcpipIsHislip)?,
        Attribute::TcpipIsHislip(true)
    );

    instr.close().ok();
    mock.join();
    Ok(())
}
