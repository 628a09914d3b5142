//! VXI-11 engine tests against an in-process record-marked RPC server.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Result;

use visa_pure::enums::attribute::{AttrKind, Attribute};
use visa_pure::enums::status::{CompletionCode, ErrorCode};
use visa_pure::flags::AccessMode;
use visa_pure::protocol::rpc::TcpRpcClient;
use visa_pure::protocol::xdr::{Packer, Unpacker};
use visa_pure::ResourceManager;

const LAST_FRAG: u32 = 0x8000_0000;

const CREATE_LINK: u32 = 10;
const DEVICE_WRITE: u32 = 11;
const DEVICE_READ: u32 = 12;
const DESTROY_LINK: u32 = 23;

fn init_logger() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

fn read_record(sock: &mut TcpStream) -> Option<Vec<u8>> {
    let mut record = Vec::new();
    loop {
        let mut header = [0u8; 4];
        sock.read_exact(&mut header).ok()?;
        let word = u32::from_be_bytes(header);
        let len = (word & !LAST_FRAG) as usize;
        let mut fragment = vec![0u8; len];
        sock.read_exact(&mut fragment).ok()?;
        record.extend(fragment);
        if word & LAST_FRAG != 0 {
            return Some(record);
        }
    }
}

fn send_record(sock: &mut TcpStream, body: &[u8]) {
    let header = (body.len() as u32 | LAST_FRAG).to_be_bytes();
    sock.write_all(&header).unwrap();
    sock.write_all(body).unwrap();
}

struct Call {
    xid: u32,
    proc: u32,
    args: Vec<u8>,
}

fn parse_call(record: &[u8]) -> Call {
    let mut u = Unpacker::new(record);
    let xid = u.unpack_u32().unwrap();
    assert_eq!(u.unpack_u32().unwrap(), 0, "must be a CALL");
    assert_eq!(u.unpack_u32().unwrap(), 2, "must be RPC version 2");
    let _prog = u.unpack_u32().unwrap();
    let _vers = u.unpack_u32().unwrap();
    let proc = u.unpack_u32().unwrap();
    u.unpack_u32().unwrap();
    u.unpack_opaque().unwrap();
    u.unpack_u32().unwrap();
    u.unpack_opaque().unwrap();
    let args = record[record.len() - u.remaining()..].to_vec();
    Call { xid, proc, args }
}

fn reply(xid: u32, body: impl FnOnce(&mut Packer)) -> Vec<u8> {
    let mut p = Packer::new();
    p.pack_u32(xid);
    p.pack_u32(1); // reply
    p.pack_u32(0); // accepted
    p.pack_u32(0); // null verifier
    p.pack_opaque(b"");
    p.pack_u32(0); // success
    body(&mut p);
    p.take()
}

type WriteLog = Arc<Mutex<Vec<(u32, Vec<u8>)>>>;

/// A scripted VXI-11 core channel: `max_recv_size` = 4, canned device_read
/// replies, every device_write logged with its flags.
fn spawn_core_server(
    listener: TcpListener,
    writes: WriteLog,
    mut read_replies: Vec<(u32, u32, Vec<u8>)>,
) -> thread::JoinHandle<()> {
    read_replies.reverse();
    thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        while let Some(record) = read_record(&mut sock) {
            let call = parse_call(&record);
            let mut u = Unpacker::new(&call.args);
            match call.proc {
                CREATE_LINK => {
                    let _client_id = u.unpack_i32().unwrap();
                    let _lock_device = u.unpack_bool().unwrap();
                    let _lock_timeout = u.unpack_u32().unwrap();
                    let device = u.unpack_opaque().unwrap();
                    assert_eq!(device, b"inst0");
                    send_record(
                        &mut sock,
                        &reply(call.xid, |p| {
                            p.pack_u32(0); // no error
                            p.pack_i32(17); // link id
                            p.pack_u32(0); // abort port
                            p.pack_u32(4); // max_recv_size
                        }),
                    );
                }
                DEVICE_WRITE => {
                    let _link = u.unpack_i32().unwrap();
                    let _io_timeout = u.unpack_u32().unwrap();
                    let _lock_timeout = u.unpack_u32().unwrap();
                    let flags = u.unpack_u32().unwrap();
                    let data = u.unpack_opaque().unwrap().to_vec();
                    writes.lock().unwrap().push((flags, data.clone()));
                    send_record(
                        &mut sock,
                        &reply(call.xid, |p| {
                            p.pack_u32(0);
                            p.pack_u32(data.len() as u32);
                        }),
                    );
                }
                DEVICE_READ => {
                    let _link = u.unpack_i32().unwrap();
                    let _request_size = u.unpack_u32().unwrap();
                    let _io_timeout = u.unpack_u32().unwrap();
                    let _lock_timeout = u.unpack_u32().unwrap();
                    let flags = u.unpack_u32().unwrap();
                    let term_char = u.unpack_i32().unwrap();
                    // the session must request term-char matching
                    assert_eq!(flags & 128, 128);
                    assert_eq!(term_char, b'\n' as i32);
                    let (error, reason, data) =
                        read_replies.pop().unwrap_or((15, 0, Vec::new()));
                    send_record(
                        &mut sock,
                        &reply(call.xid, |p| {
                            p.pack_u32(error);
                            p.pack_u32(reason);
                            p.pack_opaque(&data);
                        }),
                    );
                }
                DESTROY_LINK => {
                    send_record(&mut sock, &reply(call.xid, |p| p.pack_u32(0)));
                }
                other => panic!("unexpected procedure {}", other),
            }
        }
    })
}

/// Write of 6 bytes against `max_recv_size` = 4 must split into two
/// `device_write` calls with END only on the second; the term-char read
/// concatenates `device_read` payloads up to the first newline.
#[test]
fn fragmented_write_and_termchar_read() -> Result<()> {
    init_logger();
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let writes: WriteLog = Arc::new(Mutex::new(Vec::new()));
    let server = spawn_core_server(
        listener,
        Arc::clone(&writes),
        vec![(0, 0, b"ACME ".to_vec()), (0, 2, b"INST\n".to_vec())],
    );

    let rm = ResourceManager::new()?;
    let mut instr = rm.open(
        &format!("TCPIP::127.0.0.1,{}::INSTR", port),
        AccessMode::NO_LOCK,
        Duration::from_secs(2),
    )?;

    assert_eq!(instr.write(b"*IDN?\n")?, 6);
    {
        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].1, b"*IDN");
        assert_eq!(writes[0].0 & 8, 0, "END must be clear on the first chunk");
        assert_eq!(writes[1].1, b"?\n");
        assert_eq!(writes[1].0 & 8, 8, "END must be set on the last chunk");
    }

    instr.set_attr(Attribute::TermcharEn(true))?;
    let (data, status) = instr.read(64)?;
    assert_eq!(data, b"ACME INST\n");
    assert_eq!(status, CompletionCode::SuccessTermChar);

    instr.close().ok();
    server.join().unwrap();
    Ok(())
}

/// A 10-byte payload over `max_recv_size` = 4 takes ceil(10/4) = 3 RPCs;
/// with send-end disabled no chunk carries END.
#[test]
fn write_chunking_respects_send_end() -> Result<()> {
    init_logger();
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let writes: WriteLog = Arc::new(Mutex::new(Vec::new()));
    let server = spawn_core_server(listener, Arc::clone(&writes), Vec::new());

    let rm = ResourceManager::new()?;
    let mut instr = rm.open(
        &format!("TCPIP::127.0.0.1,{}::INSTR", port),
        AccessMode::NO_LOCK,
        Duration::from_secs(2),
    )?;

    assert_eq!(instr.write(b"0123456789")?, 10);
    {
        let mut writes = writes.lock().unwrap();
        let chunks: Vec<_> = writes.drain(..).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].1, b"0123");
        assert_eq!(chunks[1].1, b"4567");
        assert_eq!(chunks[2].1, b"89");
        assert!(chunks[..2].iter().all(|(flags, _)| flags & 8 == 0));
        assert_eq!(chunks[2].0 & 8, 8);
    }

    instr.set_attr(Attribute::SendEndEn(false))?;
    instr.write(b"abcdefgh")?;
    {
        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 2);
        assert!(writes.iter().all(|(flags, _)| flags & 8 == 0));
    }

    instr.close().ok();
    server.join().unwrap();
    Ok(())
}

/// An in-protocol io_timeout surfaces as a VISA timeout and leaves the link
/// usable; keepalive lands on the core-channel socket.
#[test]
fn read_timeout_keeps_link_usable() -> Result<()> {
    init_logger();
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let writes: WriteLog = Arc::new(Mutex::new(Vec::new()));
    let server = spawn_core_server(
        listener,
        Arc::clone(&writes),
        vec![(15, 0, Vec::new()), (0, 4, b"late answer".to_vec())],
    );

    let rm = ResourceManager::new()?;
    let mut instr = rm.open(
        &format!("TCPIP::127.0.0.1,{}::INSTR", port),
        AccessMode::NO_LOCK,
        Duration::from_secs(2),
    )?;
    instr.set_attr(Attribute::TermcharEn(true))?;

    let err = instr.read(64).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Tmo);

    let (data, status) = instr.read(64)?;
    assert_eq!(data, b"late answer");
    assert_eq!(status, CompletionCode::Success);

    instr.set_attr(Attribute::TcpipKeepalive(true))?;
    assert_eq!(
        instr.get_attr(AttrKind::TcpipKeepalive)?,
        Attribute::TcpipKeepalive(true)
    );

    instr.close().ok();
    server.join().unwrap();
    Ok(())
}

/// A delayed reply to a timed-out call must be discarded, not returned as
/// the answer to the following call.
#[test]
fn stale_rpc_reply_is_discarded() -> Result<()> {
    init_logger();
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let server = thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let first = parse_call(&read_record(&mut sock).unwrap());
        // no reply: let the caller time out
        let second = parse_call(&read_record(&mut sock).unwrap());
        // deliver the stale answer first, then the real one
        send_record(&mut sock, &reply(first.xid, |p| p.pack_u32(0x2A)));
        send_record(&mut sock, &reply(second.xid, |p| p.pack_u32(0x2B)));
    });

    let mut client = TcpRpcClient::connect(
        &addr.ip().to_string(),
        addr.port(),
        0x0607AF,
        1,
        Duration::from_secs(2),
    )?;
    client.set_io_timeout(Some(Duration::from_millis(200)))?;
    assert!(client.call(DEVICE_READ, |_| {}).is_err());

    client.set_io_timeout(Some(Duration::from_secs(2)))?;
    let result = client.call(DEVICE_READ, |_| {})?;
    assert_eq!(Unpacker::new(&result).unpack_u32().unwrap(), 0x2B);
    server.join().unwrap();
    Ok(())
}

/// Closing the session interrupts the core channel through the Abort
/// channel: a separate connection to the abort port from `create_link`,
/// carrying `device_abort` with the link id, ahead of `destroy_link`.
#[test]
fn close_aborts_in_progress_call_on_abort_channel() -> Result<()> {
    init_logger();
    let abort_listener = TcpListener::bind("127.0.0.1:0")?;
    let abort_port = abort_listener.local_addr()?.port();
    let abort_server = thread::spawn(move || {
        let (mut sock, _) = abort_listener.accept().unwrap();
        let call = parse_call(&read_record(&mut sock).unwrap());
        assert_eq!(call.proc, 1); // device_abort
        let mut u = Unpacker::new(&call.args);
        assert_eq!(u.unpack_i32().unwrap(), 17);
        send_record(&mut sock, &reply(call.xid, |p| p.pack_u32(0)));
    });

    let core_listener = TcpListener::bind("127.0.0.1:0")?;
    let core_port = core_listener.local_addr()?.port();
    let core_server = thread::spawn(move || {
        let (mut sock, _) = core_listener.accept().unwrap();
        let mut destroyed = false;
        while let Some(record) = read_record(&mut sock) {
            let call = parse_call(&record);
            match call.proc {
                CREATE_LINK => {
                    send_record(
                        &mut sock,
                        &reply(call.xid, |p| {
                            p.pack_u32(0);
                            p.pack_i32(17);
                            p.pack_u32(abort_port as u32);
                            p.pack_u32(1024);
                        }),
                    );
                }
                DESTROY_LINK => {
                    destroyed = true;
                    send_record(&mut sock, &reply(call.xid, |p| p.pack_u32(0)));
                }
                other => panic!("unexpected procedure {}", other),
            }
        }
        assert!(destroyed, "close must still destroy the link");
    });

    let rm = ResourceManager::new()?;
    let instr = rm.open(
        &format!("TCPIP::127.0.0.1,{}::INSTR", core_port),
        AccessMode::NO_LOCK,
        Duration::from_secs(2),
    )?;
    instr.close()?;

    abort_server.join().unwrap();
    core_server.join().unwrap();
    Ok(())
}
