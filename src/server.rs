//! # Debug Server Module
//!
//! The stateful command dispatcher of the remote protocol. Incoming packet
//! payloads are matched against an ordered table of literal command
//! prefixes; the first match wins, so more specific prefixes must come
//! before shorter ones (`vCont?` before `vCont`, `qSymbol:` before any
//! other `q` command a client could confuse it with). Each handler is a
//! plain function from session state and payload to one
//! [`ResponseResult`]; every malformed or failing command yields a well
//! formed wire response, the connection is never dropped for bad input.
//!
//! Protocol reference: <https://sourceware.org/gdb/onlinedocs/gdb/Remote-Protocol.html>
//! and the LLDB extensions in `lldb-gdb-remote.txt`.

mod registers;

use std::collections::VecDeque;

use tracing::{debug, trace, warn};

use crate::addr::MemoryPermissions;
use crate::debugger::{Debugger, ThreadReference, ThreadResumeAction, ThreadResumeEntry};
use crate::errors::Result;
use crate::io::DebugWriter;
use crate::protocol::{
    checksum, decode_binary, encode_binary, hex_string, parse_packets, Packet, PacketParser,
};
use crate::ThreadId;

/// Wire error codes with fixed meanings; clients match on the exact number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum ErrorCode {
    E01,
    E08,
    E09,
    E16,
    E25,
    E32,
    E44,
    E45,
    E47,
    E49,
    E51,
    E53,
    E54,
    E55,
    E68,
    E74,
    E75,
    E77,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// What one dispatched command produced
#[derive(Debug, PartialEq, Eq)]
pub enum ResponseResult {
    /// Nothing goes out
    None,
    Ok,
    Response(String),
    /// Binary escaped bytes that must not pass through text encoding
    BinaryResponse(Vec<u8>),
    /// Stop reply for the primary thread, pinning the current thread
    ThreadStopReply,
    StopReplyForThread(ThreadId),
    /// Recognized but unsupported; the wire response is an empty payload
    Unimplemented,
    /// Malformed input; the wire response is `E03`
    Invalid(String),
    Error(ErrorCode),
    /// Hand the resume actions to the session driver
    Resume(Vec<ThreadResumeEntry>, ThreadResumeAction),
    /// Tear the session down, optionally after a last response
    Exit(Option<String>),
}

/// What a call to [`DebugServer::process_packets`] ended with
#[derive(Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// All packets handled, feed more data
    Pending,
    /// The client asked to resume execution
    Resume(Vec<ThreadResumeEntry>, ThreadResumeAction),
    /// The session is over
    Exit,
}

/// Per-session state shared by all command handlers
pub struct DebugServerState {
    debugger: Box<dyn Debugger>,
    register_state: registers::RegisterHandlingState,
    process_id: Option<u32>,
    continue_thread: ThreadReference,
    current_thread: ThreadReference,
    /// Once set, frames carry `#00` and incoming checksums are not checked
    no_ack_mode: bool,
    /// The OK for QStartNoAckMode still uses the old framing; the flag
    /// flips only after that response went out
    no_ack_mode_pending: bool,
    /// Whether commands like `g` may carry a `;thread:NNN;` suffix
    thread_suffix_supported: bool,
    list_threads_in_stop_reply: bool,
}

impl DebugServerState {
    fn new(debugger: Box<dyn Debugger>) -> Self {
        let register_state =
            registers::RegisterHandlingState::new(debugger.register_context_size());
        Self {
            debugger,
            register_state,
            process_id: None,
            continue_thread: ThreadReference::All,
            current_thread: ThreadReference::All,
            no_ack_mode: false,
            no_ack_mode_pending: false,
            thread_suffix_supported: false,
            list_threads_in_stop_reply: false,
        }
    }

    fn current_thread_id(&self) -> ThreadId {
        match self.current_thread {
            ThreadReference::Id(thread_id) => thread_id,
            ThreadReference::Any | ThreadReference::All => self.debugger.primary_thread_id(),
        }
    }

    fn continue_thread_id(&self) -> ThreadId {
        match self.continue_thread {
            ThreadReference::Id(thread_id) => thread_id,
            ThreadReference::Any | ThreadReference::All => self.current_thread_id(),
        }
    }

    /// Extracts the `thread:NNN` suffix, or falls back to the current
    /// thread while the suffix feature is off
    fn extract_thread_id(&self, payload: &str) -> Option<ThreadId> {
        if !self.thread_suffix_supported {
            return Some(self.current_thread_id());
        }
        let position = payload.find("thread:")?;
        let mut parser = PacketParser::with_offset(payload, position + "thread:".len());
        parser.consume_hex_u64()
    }
}

type Handler = fn(&mut DebugServerState, &str) -> ResponseResult;

/// The dispatch table; checked strictly in order, first prefix match wins
const HANDLERS: &[(&str, Handler)] = &[
    ("?", handle_halt_reason_query),
    ("m", handle_memory_read),
    ("M", handle_memory_write),
    ("x", handle_binary_memory_read),
    ("p", registers::handle_register_read),
    ("P", registers::handle_register_write),
    ("g", registers::handle_gp_registers_read),
    ("G", registers::handle_gp_registers_write),
    ("c", handle_continue),
    ("s", handle_step),
    ("z0", handle_z),
    ("Z0", handle_z),
    ("vCont?", handle_v_cont_query),
    ("vCont", handle_v_cont),
    ("vAttach;", handle_v_attach),
    ("H", handle_set_current_thread),
    ("qC", handle_current_thread_query),
    ("T", handle_thread_status),
    ("_M", handle_allocate),
    ("_m", handle_deallocate),
    ("qThreadStopInfo", handle_q_thread_stop_info),
    ("qRegisterInfo", registers::handle_q_register_info),
    ("qShlibInfoAddr", handle_q_shlib_info_addr),
    ("qSymbol:", handle_q_symbol),
    ("qSupported", handle_q_supported),
    ("qHostInfo", handle_q_host_info),
    ("qProcessInfo", handle_q_process_info),
    ("QThreadSuffixSupported", handle_q_thread_suffix_supported),
    ("QListThreadsInStopReply", handle_q_list_threads_in_stop_reply),
    ("QSaveRegisterState", registers::handle_q_save_register_state),
    ("QRestoreRegisterState:", registers::handle_q_restore_register_state),
    ("QStartNoAckMode", handle_q_start_no_ack_mode),
    ("qEcho:", handle_q_echo),
    ("D", handle_detach),
    ("k", handle_kill),
];

// packet '?'
fn handle_halt_reason_query(_server: &mut DebugServerState, _payload: &str) -> ResponseResult {
    ResponseResult::ThreadStopReply
}

fn handle_kill(server: &mut DebugServerState, _payload: &str) -> ResponseResult {
    match server.debugger.kill() {
        // Exit with code 9 (KILL).
        Ok(()) => ResponseResult::Exit(Some("X09".into())),
        Err(_) => ResponseResult::Exit(None),
    }
}

fn handle_detach(server: &mut DebugServerState, _payload: &str) -> ResponseResult {
    server.debugger.detach();
    ResponseResult::Exit(Some("OK".into()))
}

// m packets read memory.
fn handle_memory_read(server: &mut DebugServerState, payload: &str) -> ResponseResult {
    let mut parser = PacketParser::with_offset(payload, 1);
    let Some(address) = parser.consume_address() else {
        return ResponseResult::Invalid("Missing address".into());
    };
    if !parser.consume_comma() {
        return ResponseResult::Invalid("Missing comma".into());
    }
    let Some(size) = parser.consume_hex_u64() else {
        return ResponseResult::Invalid("Missing size".into());
    };
    if size == 0 {
        return ResponseResult::Response(String::new());
    }
    match server.debugger.read_memory(address, size as usize) {
        Ok(bytes) => ResponseResult::Response(hex_string(&bytes)),
        Err(_) => ResponseResult::Error(ErrorCode::E08),
    }
}

// M packets write memory.
fn handle_memory_write(server: &mut DebugServerState, payload: &str) -> ResponseResult {
    let mut parser = PacketParser::with_offset(payload, 1);
    let Some(address) = parser.consume_address() else {
        return ResponseResult::Invalid("Missing address".into());
    };
    if !parser.consume_comma() {
        return ResponseResult::Invalid("Missing comma".into());
    }
    let Some(size) = parser.consume_hex_u64() else {
        return ResponseResult::Invalid("Missing size".into());
    };
    if size == 0 {
        return ResponseResult::Ok;
    }
    if !parser.consume_if_present(':') {
        return ResponseResult::Invalid("Missing colon".into());
    }
    let Some(bytes) = parser.read_hex_bytes() else {
        return ResponseResult::Invalid("Invalid hex bytes".into());
    };
    if bytes.len() != size as usize {
        return ResponseResult::Error(ErrorCode::E09);
    }
    match server.debugger.write_memory(address, &bytes) {
        Ok(()) => ResponseResult::Ok,
        Err(_) => ResponseResult::Error(ErrorCode::E09),
    }
}

// x packets read memory like 'm', but answer with escaped raw bytes.
fn handle_binary_memory_read(server: &mut DebugServerState, payload: &str) -> ResponseResult {
    let mut parser = PacketParser::with_offset(payload, 1);
    let Some(address) = parser.consume_address() else {
        return ResponseResult::Invalid("Missing address".into());
    };
    if !parser.consume_comma() {
        return ResponseResult::Invalid("Missing comma".into());
    }
    let Some(size) = parser.consume_hex_u64() else {
        return ResponseResult::Invalid("Missing size".into());
    };
    if size == 0 {
        // A zero length probe just acknowledges binary read support.
        return ResponseResult::Ok;
    }
    match server.debugger.read_memory(address, size as usize) {
        Ok(bytes) => ResponseResult::BinaryResponse(encode_binary(&bytes)),
        Err(_) => ResponseResult::Error(ErrorCode::E08),
    }
}

// X packets write memory from a raw binary payload. The textual header is
// delimited by the colon; everything after it is escaped binary data.
fn handle_binary_memory_write(server: &mut DebugServerState, payload: &[u8]) -> ResponseResult {
    let Some(colon) = payload.iter().position(|byte| *byte == b':') else {
        return ResponseResult::Invalid("Missing colon".into());
    };
    let header: String = payload[..colon].iter().map(|byte| *byte as char).collect();
    let mut parser = PacketParser::with_offset(&header, 1);
    let Some(address) = parser.consume_address() else {
        return ResponseResult::Invalid("Missing address".into());
    };
    if !parser.consume_comma() {
        return ResponseResult::Invalid("Missing comma".into());
    }
    let Some(size) = parser.consume_hex_u64() else {
        return ResponseResult::Invalid("Missing size".into());
    };
    if size == 0 {
        return ResponseResult::Ok;
    }
    let bytes = decode_binary(&payload[colon + 1..]);
    if bytes.len() != size as usize {
        return ResponseResult::Error(ErrorCode::E09);
    }
    match server.debugger.write_memory(address, &bytes) {
        Ok(()) => ResponseResult::Ok,
        Err(_) => ResponseResult::Error(ErrorCode::E09),
    }
}

// _M packets allocate memory with permissions (useful for JIT).
fn handle_allocate(server: &mut DebugServerState, payload: &str) -> ResponseResult {
    let mut parser = PacketParser::with_offset(payload, 2);
    let Some(size) = parser.consume_hex_u64() else {
        return ResponseResult::Invalid("Missing size".into());
    };
    if !parser.consume_comma() {
        return ResponseResult::Invalid("Missing comma".into());
    }
    let mut permissions = MemoryPermissions::NONE;
    while let Some(letter) = parser.consume_char() {
        match letter {
            'r' => permissions |= MemoryPermissions::READ,
            'w' => permissions |= MemoryPermissions::WRITE,
            'x' => permissions |= MemoryPermissions::EXECUTE,
            _ => return ResponseResult::Error(ErrorCode::E53),
        }
    }
    match server.debugger.allocate(size as usize, permissions) {
        Ok(address) => ResponseResult::Response(format!("{:x}", address.u64())),
        Err(_) => ResponseResult::Error(ErrorCode::E53),
    }
}

// _m packets deallocate memory that was allocated using _M.
fn handle_deallocate(server: &mut DebugServerState, payload: &str) -> ResponseResult {
    let mut parser = PacketParser::with_offset(payload, 2);
    let Some(address) = parser.consume_address() else {
        return ResponseResult::Error(ErrorCode::E54);
    };
    match server.debugger.deallocate(address) {
        Ok(()) => ResponseResult::Ok,
        Err(_) => ResponseResult::Error(ErrorCode::E54),
    }
}

enum ParsedThreadReference {
    Reference(ThreadReference),
    Malformed(ResponseResult),
}

/// `-1` means all threads, `0` any thread, everything else is a thread id
fn parse_thread_reference(parser: &mut PacketParser) -> ParsedThreadReference {
    if parser.consume_if_present('-') {
        if !parser.consume_if_present('1') {
            return ParsedThreadReference::Malformed(ResponseResult::Invalid(
                "Invalid thread number".into(),
            ));
        }
        return ParsedThreadReference::Reference(ThreadReference::All);
    }
    match parser.consume_hex_u64() {
        Some(0) => ParsedThreadReference::Reference(ThreadReference::Any),
        Some(thread_id) => ParsedThreadReference::Reference(ThreadReference::Id(thread_id)),
        None => {
            ParsedThreadReference::Malformed(ResponseResult::Invalid("Invalid thread number".into()))
        }
    }
}

// H packets select the current thread.
fn handle_set_current_thread(server: &mut DebugServerState, payload: &str) -> ResponseResult {
    let mut parser = PacketParser::with_offset(payload, 1);
    let kind = match parser.consume_char() {
        Some(kind @ ('c' | 'g')) => kind,
        _ => return ResponseResult::Invalid("Missing type".into()),
    };
    let thread = match parse_thread_reference(&mut parser) {
        ParsedThreadReference::Reference(thread) => thread,
        ParsedThreadReference::Malformed(result) => return result,
    };
    match kind {
        'c' => server.continue_thread = thread,
        _ => server.current_thread = thread,
    }
    ResponseResult::Ok
}

// Return the current thread ID for qC packets.
fn handle_current_thread_query(server: &mut DebugServerState, _payload: &str) -> ResponseResult {
    let thread_id = server.current_thread_id();
    // Pin the selection so an ambiguous Any/All choice stays resolved.
    server.current_thread = ThreadReference::Id(thread_id);
    ResponseResult::Response(format!("QC{thread_id:x}"))
}

// T - is the thread alive?
fn handle_thread_status(server: &mut DebugServerState, payload: &str) -> ResponseResult {
    let mut parser = PacketParser::with_offset(payload, 1);
    let Some(thread_id) = parser.consume_hex_u64() else {
        return ResponseResult::Invalid("No thread id given".into());
    };
    match server.debugger.is_thread_alive(thread_id) {
        Ok(true) => ResponseResult::Ok,
        Ok(false) | Err(_) => ResponseResult::Error(ErrorCode::E16),
    }
}

// qThreadStopInfo - info about a thread stop.
fn handle_q_thread_stop_info(_server: &mut DebugServerState, payload: &str) -> ResponseResult {
    let mut parser = PacketParser::with_offset(payload, "qThreadStopInfo".len());
    let Some(thread_id) = parser.consume_hex_u64() else {
        return ResponseResult::Invalid("No thread id given".into());
    };
    ResponseResult::StopReplyForThread(thread_id)
}

// vCont?
fn handle_v_cont_query(_server: &mut DebugServerState, _payload: &str) -> ResponseResult {
    // Support 'c' (continue) and 's' (step).
    ResponseResult::Response("vCont;c;s".into())
}

// vCont
fn handle_v_cont(server: &mut DebugServerState, payload: &str) -> ResponseResult {
    if payload == "vCont;c" {
        return handle_continue(server, "c");
    }
    if payload == "vCont;s" {
        return handle_step(server, "s");
    }
    let mut parser = PacketParser::with_offset(payload, "vCont".len());
    let mut entries: Vec<ThreadResumeEntry> = Vec::new();
    let mut default_action: Option<ThreadResumeAction> = None;
    while parser.consume_if_present(';') {
        let action = match parser.consume_char() {
            Some('c') => ThreadResumeAction::Continue,
            Some('s') => ThreadResumeAction::Step,
            _ => return ResponseResult::Invalid("Unsupported vCont action".into()),
        };
        if parser.consume_if_present(':') {
            match parse_thread_reference(&mut parser) {
                ParsedThreadReference::Reference(thread) => entries.push(ThreadResumeEntry {
                    thread,
                    action,
                    address: None,
                }),
                ParsedThreadReference::Malformed(result) => return result,
            }
        } else {
            if default_action.is_some() {
                return ResponseResult::Invalid(
                    "Default action is specified more than once".into(),
                );
            }
            default_action = Some(action);
        }
    }
    if default_action.is_none() && entries.is_empty() {
        return ResponseResult::Invalid("No action specified".into());
    }
    // The eventual reply is the stop/exit notification after the resume.
    ResponseResult::Resume(entries, default_action.unwrap_or(ThreadResumeAction::Stop))
}

// c [addr]
fn handle_continue(server: &mut DebugServerState, payload: &str) -> ResponseResult {
    let mut parser = PacketParser::with_offset(payload, 1);
    let address = if parser.has_contents() {
        let Some(address) = parser.consume_address() else {
            return ResponseResult::Invalid("Invalid address".into());
        };
        Some(address)
    } else {
        None
    };
    // Don't send an OK: the response is the eventual stopped/exited reply.
    ResponseResult::Resume(
        vec![ThreadResumeEntry {
            thread: server.continue_thread,
            action: ThreadResumeAction::Continue,
            address,
        }],
        ThreadResumeAction::Continue,
    )
}

// s [addr]
fn handle_step(server: &mut DebugServerState, payload: &str) -> ResponseResult {
    let mut parser = PacketParser::with_offset(payload, 1);
    let address = if parser.has_contents() {
        let Some(address) = parser.consume_address() else {
            return ResponseResult::Invalid("Invalid address".into());
        };
        Some(address)
    } else {
        None
    };
    // Make all other threads stop while one steps.
    ResponseResult::Resume(
        vec![ThreadResumeEntry {
            thread: ThreadReference::Id(server.continue_thread_id()),
            action: ThreadResumeAction::Step,
            address,
        }],
        ThreadResumeAction::Stop,
    )
}

// z/Z packets control the breakpoints/watchpoints.
fn handle_z(server: &mut DebugServerState, payload: &str) -> ResponseResult {
    let mut parser = PacketParser::new(payload);
    let (Some(command), Some(breakpoint_type)) = (parser.consume_char(), parser.consume_char())
    else {
        return ResponseResult::Invalid(String::new());
    };
    if !parser.consume_comma() {
        return ResponseResult::Invalid("Missing comma separator".into());
    }
    let Some(address) = parser.consume_address() else {
        return ResponseResult::Invalid("Invalid address".into());
    };
    if !parser.consume_comma() {
        return ResponseResult::Invalid("Missing comma separator".into());
    }
    let Some(byte_size) = parser.consume_hex_u64() else {
        return ResponseResult::Invalid("Invalid byte size / kind".into());
    };

    if breakpoint_type != '0' {
        // Could be a hardware breakpoint (1) or a watchpoint (2, 3, 4);
        // neither is implemented.
        return ResponseResult::Unimplemented;
    }
    match command {
        'Z' => match server.debugger.set_breakpoint(address, byte_size as usize) {
            Ok(()) => ResponseResult::Ok,
            Err(_) => ResponseResult::Error(ErrorCode::E09),
        },
        'z' => match server.debugger.remove_breakpoint(address) {
            Ok(()) => ResponseResult::Ok,
            Err(_) => ResponseResult::Error(ErrorCode::E08),
        },
        _ => ResponseResult::Unimplemented,
    }
}

fn handle_q_shlib_info_addr(server: &mut DebugServerState, _payload: &str) -> ResponseResult {
    match server.debugger.get_shared_library_info_address() {
        Ok(address) => ResponseResult::Response(format!("{:x}", address.u64())),
        Err(_) => ResponseResult::Error(ErrorCode::E44),
    }
}

fn handle_q_symbol(_server: &mut DebugServerState, _payload: &str) -> ResponseResult {
    // No symbol lookups needed, we live inside the symbols.
    ResponseResult::Ok
}

fn handle_q_supported(_server: &mut DebugServerState, _payload: &str) -> ResponseResult {
    ResponseResult::Response("PacketSize=20000;qEcho+".into())
}

// Enables the thread suffix for the 'g', 'G', 'p' and 'P' commands.
fn handle_q_thread_suffix_supported(
    server: &mut DebugServerState,
    _payload: &str,
) -> ResponseResult {
    server.thread_suffix_supported = true;
    ResponseResult::Ok
}

// Enables thread information in the stop reply packets.
fn handle_q_list_threads_in_stop_reply(
    server: &mut DebugServerState,
    _payload: &str,
) -> ResponseResult {
    server.list_threads_in_stop_reply = true;
    ResponseResult::Ok
}

/// x86_64 type/subtype constants the protocol inherited from Mach-O
const CPU_TYPE_X86_64: u32 = 0x0100_0007;
const CPU_SUBTYPE_X86_64_ALL: u32 = 3;

fn host_process_info(is_host_info: bool) -> String {
    let mut result = String::new();
    if is_host_info {
        result.push_str(&format!(
            "cputype:{CPU_TYPE_X86_64};cpusubtype:{CPU_SUBTYPE_X86_64_ALL};"
        ));
    } else {
        result.push_str(&format!(
            "cputype:{CPU_TYPE_X86_64:x};cpusubtype:{CPU_SUBTYPE_X86_64_ALL:x};"
        ));
    }
    result.push_str("ostype:linux;");
    result.push_str("endian:little;");
    let pointer_size = std::mem::size_of::<usize>();
    if is_host_info {
        result.push_str(&format!("ptrsize:{pointer_size};"));
    } else {
        result.push_str(&format!("ptrsize:{pointer_size:x}"));
    }
    result
}

// Returns host information.
fn handle_q_host_info(_server: &mut DebugServerState, _payload: &str) -> ResponseResult {
    ResponseResult::Response(host_process_info(true))
}

// Returns process information.
fn handle_q_process_info(server: &mut DebugServerState, _payload: &str) -> ResponseResult {
    let Some(process_id) = server.process_id else {
        return ResponseResult::Error(ErrorCode::E68);
    };
    let mut result = String::new();
    result.push_str(&format!("pid:{process_id:x};"));
    result.push_str(&format!(
        "parent-pid:{:x};",
        nix::unistd::getppid().as_raw()
    ));
    result.push_str(&format!("real-uid:{:x};", nix::unistd::getuid().as_raw()));
    result.push_str(&format!("real-gid:{:x};", nix::unistd::getgid().as_raw()));
    result.push_str(&format!(
        "effective-uid:{:x};",
        nix::unistd::geteuid().as_raw()
    ));
    result.push_str(&format!(
        "effective-gid:{:x};",
        nix::unistd::getegid().as_raw()
    ));
    result.push_str(&host_process_info(false));
    ResponseResult::Response(result)
}

fn handle_q_echo(_server: &mut DebugServerState, payload: &str) -> ResponseResult {
    // Send the payload back.
    ResponseResult::Response(payload.to_string())
}

// vAttach
// Note: vAttachOrWait, vAttachName and vAttachWait aren't supported.
fn handle_v_attach(server: &mut DebugServerState, payload: &str) -> ResponseResult {
    let mut parser = PacketParser::with_offset(payload, "vAttach;".len());
    let Some(process_id) = parser.consume_hex_u64() else {
        return ResponseResult::Invalid("No PID given".into());
    };
    server.process_id = Some(process_id as u32);
    match server.debugger.attach(process_id as u32) {
        // The real response is a stop reply for the primary thread.
        Ok(()) => ResponseResult::ThreadStopReply,
        // E01 is the attachment failure error.
        Err(_) => ResponseResult::Error(ErrorCode::E01),
    }
}

fn handle_q_start_no_ack_mode(server: &mut DebugServerState, _payload: &str) -> ResponseResult {
    // The OK for this very packet still uses the old framing; the session
    // loop commits the flag right after sending it.
    server.no_ack_mode_pending = true;
    ResponseResult::Ok
}

/// The remote protocol session: dispatcher state plus the outgoing half of
/// the connection
///
/// Incoming bytes are fed in by the caller (see
/// [`Self::process_packets`]); this keeps the server independent of the
/// transport and directly testable.
pub struct DebugServer<W: DebugWriter> {
    state: DebugServerState,
    writer: W,
    partial_data: Vec<u8>,
    saved_packets: VecDeque<Packet>,
}

impl<W: DebugWriter> DebugServer<W> {
    pub fn new(debugger: Box<dyn Debugger>, writer: W) -> Self {
        Self {
            state: DebugServerState::new(debugger),
            writer,
            partial_data: Vec::new(),
            saved_packets: VecDeque::new(),
        }
    }

    /// The debugger behind this session, e.g. to apply resume actions
    pub fn debugger_mut(&mut self) -> &mut dyn Debugger {
        &mut *self.state.debugger
    }

    /// Sends the stop reply notification after a resume came to a halt
    ///
    /// # Errors
    ///
    /// Fails when writing to the connection fails.
    pub fn send_stop_reply(&mut self) -> Result<()> {
        self.send_response(ResponseResult::ThreadStopReply)
    }

    /// Dispatches one textual packet payload
    pub fn handle_packet_payload(&mut self, payload: &str) -> ResponseResult {
        trace!("dispatching packet: {payload}");
        for (prefix, handler) in HANDLERS {
            if payload.starts_with(prefix) {
                return handler(&mut self.state, payload);
            }
        }
        ResponseResult::Unimplemented
    }

    /// Dispatches one binary packet payload
    pub fn handle_binary_packet_payload(&mut self, payload: &[u8]) -> ResponseResult {
        if payload.first() == Some(&b'X') {
            return handle_binary_memory_write(&mut self.state, payload);
        }
        ResponseResult::Unimplemented
    }

    /// Formats the stop reply a `ThreadStopReply`/`StopReplyForThread`
    /// result stands for
    pub fn handle_stop_reply(&mut self, result: ResponseResult) -> ResponseResult {
        match result {
            ResponseResult::ThreadStopReply => {
                let thread_id = self.state.debugger.primary_thread_id();
                self.state.current_thread = ThreadReference::Id(thread_id);
                self.stop_reply_for_thread(thread_id)
            }
            ResponseResult::StopReplyForThread(thread_id) => self.stop_reply_for_thread(thread_id),
            _ => {
                debug_assert!(false, "not a stop reply result");
                ResponseResult::None
            }
        }
    }

    fn stop_reply_for_thread(&mut self, thread_id: ThreadId) -> ResponseResult {
        let Ok(info) = self.state.debugger.get_stop_info_for_thread(thread_id) else {
            return ResponseResult::Error(ErrorCode::E51);
        };
        let mut result = format!("T{:02x}", info.signal_number);
        result.push_str(&format!("thread:{thread_id:x};"));
        if let Some(address) = info.dispatch_queue_address {
            result.push_str(&format!("qaddr:{:x};", address.u64()));
        }
        if self.state.list_threads_in_stop_reply {
            let threads = self.state.debugger.threads();
            let ids: Vec<String> = threads.iter().map(|tid| format!("{tid:x}")).collect();
            result.push_str(&format!("threads:{};", ids.join(",")));
            let pcs: crate::errors::Result<Vec<String>> = threads
                .iter()
                .map(|tid| {
                    self.state
                        .debugger
                        .get_ip_register_value_for_thread(*tid)
                        .map(|address| format!("{:x}", address.u64()))
                })
                .collect();
            // Leave the field out entirely if any pc is unavailable.
            if let Ok(pcs) = pcs {
                result.push_str(&format!("thread-pcs:{};", pcs.join(",")));
            }
        }
        if let Err(error) =
            registers::emit_stop_info_registers(&mut self.state, thread_id, &mut result)
        {
            warn!("failed to emit register info in stop reply: {error}");
        }
        if let Some(detail) = info.exception {
            result.push_str(&format!("metype:{:x};", detail.exception_type));
            result.push_str(&format!("mecount:{:x};", detail.data.len()));
            for word in detail.data {
                result.push_str(&format!("medata:{word:x};"));
            }
        }
        ResponseResult::Response(result)
    }

    fn send(&mut self, payload: &[u8]) -> Result<()> {
        let mut output = Vec::with_capacity(payload.len() + 4);
        output.push(b'$');
        output.extend_from_slice(payload);
        output.push(b'#');
        if self.state.no_ack_mode {
            output.extend_from_slice(b"00");
        } else {
            output.extend_from_slice(hex_string(&[checksum(payload)]).as_bytes());
        }
        self.writer.write(&output)
    }

    fn send_ack(&mut self) -> Result<()> {
        self.writer.write(b"+")
    }

    fn send_nack(&mut self) -> Result<()> {
        self.writer.write(b"-")
    }

    fn send_response(&mut self, result: ResponseResult) -> Result<()> {
        match result {
            ResponseResult::None => {}
            ResponseResult::Ok => self.send(b"OK")?,
            ResponseResult::Response(response) => self.send(response.as_bytes())?,
            ResponseResult::BinaryResponse(bytes) => self.send(&bytes)?,
            result @ (ResponseResult::ThreadStopReply | ResponseResult::StopReplyForThread(_)) => {
                let reply = self.handle_stop_reply(result);
                self.send_response(reply)?;
            }
            ResponseResult::Unimplemented => self.send(b"")?,
            ResponseResult::Invalid(reason) => {
                debug!("rejecting malformed packet: {reason}");
                self.send(b"E03")?;
            }
            ResponseResult::Error(kind) => self.send(kind.to_string().as_bytes())?,
            ResponseResult::Resume(..) | ResponseResult::Exit(_) => {
                debug_assert!(false, "resume/exit are not wire responses");
            }
        }
        // QStartNoAckMode's own OK went out with the old framing; switch
        // now.
        if self.state.no_ack_mode_pending {
            self.state.no_ack_mode_pending = false;
            self.state.no_ack_mode = true;
            debug!("no-ack mode enabled");
        }
        Ok(())
    }

    /// Feeds connection bytes into the session
    ///
    /// Handles every complete packet in order: ACK (unless no-ack mode)
    /// then dispatch for payloads, NACK for malformed frames, the
    /// interrupt path for `0x03`. Returns when all packets are consumed,
    /// when a handler asks for a resume (remaining packets are kept for
    /// the next call, except that a pending interrupt turns the resume
    /// into an exit), or when the session ends.
    ///
    /// # Errors
    ///
    /// Fails when writing to the connection fails.
    pub fn process_packets(&mut self, data: &[u8]) -> Result<SessionOutcome> {
        let mut packets = std::mem::take(&mut self.saved_packets);
        packets.extend(parse_packets(
            &mut self.partial_data,
            data,
            !self.state.no_ack_mode,
        ));

        while let Some(packet) = packets.pop_front() {
            match packet {
                Packet::Payload(payload) => {
                    if !self.state.no_ack_mode {
                        self.send_ack()?;
                    }
                    let result = self.handle_packet_payload(&payload);
                    if let Some(outcome) = self.finish_packet(result, &mut packets)? {
                        return Ok(outcome);
                    }
                }
                Packet::BinaryPayload(payload) => {
                    if !self.state.no_ack_mode {
                        self.send_ack()?;
                    }
                    let result = self.handle_binary_packet_payload(&payload);
                    if let Some(outcome) = self.finish_packet(result, &mut packets)? {
                        return Ok(outcome);
                    }
                }
                Packet::Ack | Packet::Nack => {
                    // Don't resend on NACKs.
                }
                Packet::Interrupt => {
                    if let Err(error) = self.state.debugger.interrupt_execution() {
                        warn!("could not interrupt execution: {error}");
                    }
                    self.send_response(ResponseResult::ThreadStopReply)?;
                }
                Packet::InvalidPacket | Packet::InvalidChecksum => {
                    self.send_nack()?;
                }
            }
        }
        Ok(SessionOutcome::Pending)
    }

    fn finish_packet(
        &mut self,
        result: ResponseResult,
        remaining: &mut VecDeque<Packet>,
    ) -> Result<Option<SessionOutcome>> {
        match result {
            ResponseResult::Resume(entries, default_action) => {
                // Resuming with an un-actioned interrupt pending is
                // unsafe; exit instead.
                if remaining.iter().any(|packet| *packet == Packet::Interrupt) {
                    return Ok(Some(SessionOutcome::Exit));
                }
                self.saved_packets = std::mem::take(remaining);
                Ok(Some(SessionOutcome::Resume(entries, default_action)))
            }
            ResponseResult::Exit(final_response) => {
                if let Some(response) = final_response {
                    self.send_response(ResponseResult::Response(response))?;
                }
                Ok(Some(SessionOutcome::Exit))
            }
            result => {
                self.send_response(result)?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::addr::Address;
    use crate::debugger::{StopExceptionDetail, ThreadStopInfo};
    use crate::errors::StubError;

    fn unexpected() -> StubError {
        StubError::Kernel {
            code: -1,
            message: "unexpected mock call".into(),
        }
    }

    /// Scripted debugger double, asserting the exact calls the commands
    /// should make
    #[derive(Default)]
    struct MockDebugger {
        expected_set_breakpoints: VecDeque<(u64, usize)>,
        expected_allocates: VecDeque<(usize, MemoryPermissions)>,
        expected_deallocates: VecDeque<u64>,
        // The queues popped from `&self` methods sit in RefCells.
        expected_memory_reads: RefCell<VecDeque<(u64, usize)>>,
        expected_memory_writes: VecDeque<(u64, Vec<u8>)>,
        expected_register_reads: RefCell<VecDeque<(ThreadId, u32, u32, u64)>>,
        expected_register_writes: VecDeque<(ThreadId, u32, u32, u64)>,
        expected_context_reads: RefCell<VecDeque<(ThreadId, Vec<u8>)>>,
        expected_context_writes: VecDeque<(ThreadId, Vec<u8>)>,
        stop_infos: RefCell<VecDeque<(ThreadId, ThreadStopInfo)>>,
        interrupt_counter: Arc<AtomicUsize>,
        fixed_register_read: Option<u64>,
    }

    impl Debugger for MockDebugger {
        fn register_context_size(&self) -> usize {
            24
        }

        fn primary_thread_id(&self) -> ThreadId {
            0xc
        }

        fn threads(&self) -> Vec<ThreadId> {
            vec![self.primary_thread_id()]
        }

        fn attach(&mut self, process_id: u32) -> crate::errors::Result<()> {
            assert_eq!(process_id, 0x12345);
            Ok(())
        }

        fn detach(&mut self) {}

        fn kill(&mut self) -> crate::errors::Result<()> {
            Ok(())
        }

        fn interrupt_execution(&mut self) -> crate::errors::Result<()> {
            self.interrupt_counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_thread_alive(&self, thread_id: ThreadId) -> crate::errors::Result<bool> {
            Ok(thread_id == 0x405)
        }

        fn get_stop_info_for_thread(
            &self,
            thread_id: ThreadId,
        ) -> crate::errors::Result<ThreadStopInfo> {
            let (expected_tid, info) = self
                .stop_infos
                .borrow_mut()
                .pop_front()
                .ok_or_else(unexpected)?;
            assert_eq!(expected_tid, thread_id);
            Ok(info)
        }

        fn get_shared_library_info_address(&self) -> crate::errors::Result<Address> {
            Ok(Address::from(0x1013usize))
        }

        fn set_breakpoint(&mut self, address: Address, byte_size: usize) -> crate::errors::Result<()> {
            let (expected_address, expected_size) =
                self.expected_set_breakpoints.pop_front().ok_or_else(unexpected)?;
            assert_eq!(expected_address, address.u64());
            assert_eq!(expected_size, byte_size);
            Ok(())
        }

        fn remove_breakpoint(&mut self, _address: Address) -> crate::errors::Result<()> {
            Ok(())
        }

        fn allocate(
            &mut self,
            size: usize,
            permissions: MemoryPermissions,
        ) -> crate::errors::Result<Address> {
            let (expected_size, expected_permissions) =
                self.expected_allocates.pop_front().ok_or_else(unexpected)?;
            assert_eq!(expected_size, size);
            assert_eq!(expected_permissions, permissions);
            Ok(Address::from(0xADBEEFusize))
        }

        fn deallocate(&mut self, address: Address) -> crate::errors::Result<()> {
            let expected = self.expected_deallocates.pop_front().ok_or_else(unexpected)?;
            assert_eq!(expected, address.u64());
            Ok(())
        }

        fn read_memory(&self, address: Address, size: usize) -> crate::errors::Result<Vec<u8>> {
            let (expected_address, expected_size) = self
                .expected_memory_reads
                .borrow_mut()
                .pop_front()
                .ok_or_else(unexpected)?;
            assert_eq!(expected_address, address.u64());
            assert_eq!(expected_size, size);
            Ok((0..size).map(|index| index as u8).collect())
        }

        fn write_memory(&mut self, address: Address, bytes: &[u8]) -> crate::errors::Result<()> {
            let (expected_address, expected_bytes) =
                self.expected_memory_writes.pop_front().ok_or_else(unexpected)?;
            assert_eq!(expected_address, address.u64());
            assert_eq!(expected_bytes, bytes);
            Ok(())
        }

        fn get_register_value_for_thread(
            &self,
            thread_id: ThreadId,
            register_id: u32,
            register_set_id: u32,
            dest: &mut [u8],
        ) -> crate::errors::Result<usize> {
            if let Some(value) = self.fixed_register_read {
                dest[..8].copy_from_slice(&value.to_le_bytes());
                return Ok(8);
            }
            let (expected_tid, expected_register, expected_set, value) = self
                .expected_register_reads
                .borrow_mut()
                .pop_front()
                .ok_or_else(unexpected)?;
            assert_eq!(expected_tid, thread_id);
            assert_eq!(expected_register, register_id);
            assert_eq!(expected_set, register_set_id);
            dest[..8].copy_from_slice(&value.to_le_bytes());
            Ok(8)
        }

        fn set_register_value_for_thread(
            &mut self,
            thread_id: ThreadId,
            register_id: u32,
            register_set_id: u32,
            source: &[u8],
        ) -> crate::errors::Result<()> {
            let (expected_tid, expected_register, expected_set, expected_value) = self
                .expected_register_writes
                .pop_front()
                .ok_or_else(unexpected)?;
            assert_eq!(expected_tid, thread_id);
            assert_eq!(expected_register, register_id);
            assert_eq!(expected_set, register_set_id);
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&source[..8]);
            assert_eq!(expected_value, u64::from_le_bytes(bytes));
            Ok(())
        }

        fn get_ip_register_value_for_thread(
            &self,
            _thread_id: ThreadId,
        ) -> crate::errors::Result<Address> {
            Ok(Address::from(0xdeadbeefusize))
        }

        fn get_register_context_for_thread(
            &self,
            thread_id: ThreadId,
            dest: &mut [u8],
        ) -> crate::errors::Result<usize> {
            let (expected_tid, bytes) = self
                .expected_context_reads
                .borrow_mut()
                .pop_front()
                .ok_or_else(unexpected)?;
            assert_eq!(expected_tid, thread_id);
            dest[..bytes.len()].copy_from_slice(&bytes);
            Ok(bytes.len())
        }

        fn set_register_context_for_thread(
            &mut self,
            thread_id: ThreadId,
            source: &[u8],
        ) -> crate::errors::Result<()> {
            let (expected_tid, expected_bytes) =
                self.expected_context_writes.pop_front().ok_or_else(unexpected)?;
            assert_eq!(expected_tid, thread_id);
            assert_eq!(expected_bytes, source);
            Ok(())
        }

        fn resume(
            &mut self,
            _entries: &[ThreadResumeEntry],
            _default_action: ThreadResumeAction,
        ) -> crate::errors::Result<()> {
            Ok(())
        }
    }

    /// Captures everything the server sends
    #[derive(Default)]
    struct SinkWriter {
        sent: Vec<u8>,
    }

    impl DebugWriter for &mut SinkWriter {
        fn write(&mut self, data: &[u8]) -> crate::errors::Result<()> {
            self.sent.extend_from_slice(data);
            Ok(())
        }
    }

    fn register_context(values: &[u64]) -> Vec<u8> {
        values.iter().flat_map(|value| value.to_le_bytes()).collect()
    }

    fn invalid(result: ResponseResult) -> bool {
        matches!(result, ResponseResult::Invalid(_))
    }

    fn response(text: &str) -> ResponseResult {
        ResponseResult::Response(text.to_string())
    }

    fn continue_entry(
        thread: ThreadReference,
        address: Option<Address>,
    ) -> ResponseResult {
        ResponseResult::Resume(
            vec![ThreadResumeEntry {
                thread,
                action: ThreadResumeAction::Continue,
                address,
            }],
            ThreadResumeAction::Continue,
        )
    }

    fn step_entry(thread: ThreadReference, address: Option<Address>) -> ResponseResult {
        ResponseResult::Resume(
            vec![ThreadResumeEntry {
                thread,
                action: ThreadResumeAction::Step,
                address,
            }],
            ThreadResumeAction::Stop,
        )
    }

    #[test]
    fn test_error_code_rendering() {
        assert_eq!(ErrorCode::E08.to_string(), "E08");
        assert_eq!(ErrorCode::E77.to_string(), "E77");
    }

    #[test]
    fn test_command_dispatch() {
        let mock = MockDebugger {
            expected_set_breakpoints: VecDeque::from(vec![(0xABA, 1), (0xBAA, 255)]),
            expected_allocates: VecDeque::from(vec![
                (0x104, MemoryPermissions::READ | MemoryPermissions::WRITE),
                (0x1234567812345678, MemoryPermissions::ALL),
            ]),
            expected_deallocates: VecDeque::from(vec![0xadbeef]),
            expected_memory_reads: RefCell::new(VecDeque::from(vec![
                (0xA0B, 4),
                (0x123456789, 0x11),
                (0xA0B, 4),
                (0x4040, 256),
            ])),
            expected_memory_writes: VecDeque::from(vec![
                (0xBEEF, vec![0, 7, 0xAA, 0xBB, 0xCC, 0xEE, 0x12, 0x34]),
                (0xBEEF, vec![0, 7, 0xAA, 0xBB, 1, 2, 3, 4]),
            ]),
            expected_register_reads: RefCell::new(VecDeque::from(vec![
                (0xc, 0, 1, 0),
                (0xa2a, 0, 1, 2),
                (0xa2a, 0x10, 1, 0x4091),
                (0, 0xf, 1, u64::MAX),
            ])),
            expected_register_writes: VecDeque::from(vec![
                (0x808, 0, 1, 0xefcdab78563412),
                (0x808, 0xa, 1, 0x1000000000000000),
                (0x71f, 3, 1, u64::MAX),
                (0x808, 0x11, 1, 2),
            ]),
            expected_context_reads: RefCell::new(VecDeque::from(vec![
                (0x42, register_context(&[2, u64::MAX, 0x4091])),
                (0x42, register_context(&[2, u64::MAX, 0x4091])),
                (0x42, register_context(&[0, 5, 11])),
            ])),
            expected_context_writes: VecDeque::from(vec![
                (0x42, register_context(&[0xF1Fa, i64::MAX as u64, 0])),
                (0x42, register_context(&[2, u64::MAX, 0x4091])),
                (0x42, register_context(&[0, 5, 11])),
            ]),
            ..MockDebugger::default()
        };
        let mut sink = SinkWriter::default();
        let mut server = DebugServer::new(Box::new(mock), &mut sink);

        assert_eq!(
            server.handle_packet_payload("foo"),
            ResponseResult::Unimplemented
        );
        assert_eq!(server.handle_packet_payload(""), ResponseResult::Unimplemented);

        // Breakpoints
        assert_eq!(server.handle_packet_payload("Z0,ABA,1"), ResponseResult::Ok);
        assert_eq!(server.handle_packet_payload("z0,ABA,1"), ResponseResult::Ok);
        assert_eq!(server.handle_packet_payload("Z0,BAA,FF"), ResponseResult::Ok);
        assert_eq!(server.handle_packet_payload("z0,BAA,2"), ResponseResult::Ok);
        assert_eq!(
            server.handle_packet_payload("z1,BA,0"),
            ResponseResult::Unimplemented
        );
        assert_eq!(
            server.handle_packet_payload("z2,F00,0"),
            ResponseResult::Unimplemented
        );
        assert!(invalid(server.handle_packet_payload("z0")));
        assert!(invalid(server.handle_packet_payload("z0,")));
        assert!(invalid(server.handle_packet_payload("z0,A")));
        assert!(invalid(server.handle_packet_payload("z0,A,")));

        // Memory allocate/deallocate
        assert_eq!(server.handle_packet_payload("_M104,rw"), response("adbeef"));
        assert_eq!(server.handle_packet_payload("_madBEef"), ResponseResult::Ok);
        assert_eq!(
            server.handle_packet_payload("_M1234567812345678,rwx"),
            response("adbeef")
        );
        assert!(invalid(server.handle_packet_payload("_M1234567812345678A,rw")));
        assert!(invalid(server.handle_packet_payload("_M,")));

        // Memory read/write
        assert_eq!(server.handle_packet_payload("mA0B,4"), response("00010203"));
        assert_eq!(
            server.handle_packet_payload("m123456789,011"),
            response("000102030405060708090a0b0c0d0e0f10")
        );
        // A zero sized read answers empty without touching memory.
        assert_eq!(server.handle_packet_payload("m0,0"), response(""));
        assert!(invalid(server.handle_packet_payload("mA0B,-")));
        assert!(invalid(server.handle_packet_payload("mA")));
        assert!(invalid(server.handle_packet_payload("m")));

        assert_eq!(
            server.handle_packet_payload("MBEEF,8:0007AABBCCEE1234"),
            ResponseResult::Ok
        );
        assert_eq!(server.handle_packet_payload("M0,0"), ResponseResult::Ok);
        assert_eq!(
            server.handle_packet_payload("MBEEF,16:0000AABBCCEE1234"),
            ResponseResult::Error(ErrorCode::E09)
        );
        assert!(invalid(server.handle_packet_payload("M")));
        assert!(invalid(server.handle_packet_payload("Ma,")));
        assert!(invalid(server.handle_packet_payload("M10,4")));
        assert!(invalid(server.handle_packet_payload("M10,4:a")));

        // Binary memory read/write
        assert_eq!(server.handle_packet_payload("x0,0"), ResponseResult::Ok);
        assert_eq!(
            server.handle_packet_payload("xA0B,4"),
            ResponseResult::BinaryResponse(vec![0, 1, 2, 3])
        );
        let ResponseResult::BinaryResponse(read_bytes) =
            server.handle_packet_payload("x4040,100")
        else {
            panic!("binary read expected");
        };
        assert_eq!(read_bytes.len(), 256 + 4);
        assert_eq!(
            decode_binary(&read_bytes),
            (0..256).map(|index| index as u8).collect::<Vec<u8>>()
        );
        assert_eq!(
            server.handle_binary_packet_payload(b"X0,0:"),
            ResponseResult::Ok
        );
        let mut binary_write = b"XBEEF,8:".to_vec();
        binary_write.extend_from_slice(&[0, 7, 0xAA, 0xBB, 1, 2, 3, 4]);
        assert_eq!(
            server.handle_binary_packet_payload(&binary_write),
            ResponseResult::Ok
        );

        // Register info
        assert_eq!(
            server.handle_packet_payload("qRegisterInfo1000"),
            ResponseResult::Error(ErrorCode::E45)
        );
        assert!(invalid(server.handle_packet_payload("qRegisterInfo")));
        assert_eq!(
            server.handle_packet_payload("qRegisterInfo0"),
            response(
                "name:rax;bitsize:64;offset:0;encoding:uint;format:hex;\
                 set:General Purpose Registers;ehframe:0;dwarf:0;\
                 invalidate-regs:0,15,25,35,39;"
            )
        );
        assert_eq!(
            server.handle_packet_payload("qRegisterInfo15"),
            response(
                "name:eax;bitsize:32;offset:0;encoding:uint;format:hex;\
                 set:General Purpose Registers;container-regs:0;\
                 invalidate-regs:0,15,25,35,39;"
            )
        );

        // Register read/write
        assert_eq!(
            server.handle_packet_payload("p0"),
            response("0000000000000000")
        );
        assert_eq!(
            server.handle_packet_payload("QThreadSuffixSupported"),
            ResponseResult::Ok
        );
        assert!(invalid(server.handle_packet_payload("p")));
        assert_eq!(
            server.handle_packet_payload("pffffff;thread:0;"),
            ResponseResult::Error(ErrorCode::E47)
        );
        assert!(invalid(server.handle_packet_payload("P")));
        assert_eq!(
            server.handle_packet_payload("Pffffff=0000000000000010"),
            ResponseResult::Error(ErrorCode::E47)
        );
        assert!(invalid(server.handle_packet_payload("P0,00")));
        assert!(invalid(server.handle_packet_payload("P0=123;thread:0;")));
        assert!(invalid(server.handle_packet_payload("P0=12;thread:0;")));

        assert_eq!(
            server.handle_packet_payload("p0;thread:a2a;"),
            response("0200000000000000")
        );
        assert_eq!(
            server.handle_packet_payload("p10;thread:a2a;"),
            response("9140000000000000")
        );
        assert_eq!(
            server.handle_packet_payload("pF;thread:0;"),
            response("ffffffffffffffff")
        );
        assert_eq!(
            server.handle_packet_payload("P0=12345678abcdef00;thread:808;"),
            ResponseResult::Ok
        );
        assert_eq!(
            server.handle_packet_payload("Pa=0000000000000010;thread:808;"),
            ResponseResult::Ok
        );
        assert_eq!(
            server.handle_packet_payload("P3=ffffffffffffffff;thread:71f;"),
            ResponseResult::Ok
        );
        assert_eq!(
            server.handle_packet_payload("P11=0200000000000000;thread:808;"),
            ResponseResult::Ok
        );

        // Whole register context
        assert!(invalid(server.handle_packet_payload("g")));
        assert_eq!(
            server.handle_packet_payload("g;thread:42;"),
            response("0200000000000000ffffffffffffffff9140000000000000")
        );
        assert!(invalid(server.handle_packet_payload("G")));
        assert!(invalid(server.handle_packet_payload("G;thread:0;")));
        assert!(invalid(server.handle_packet_payload("G=12;thread:0;")));
        assert_eq!(
            server.handle_packet_payload(
                "GFaF1000000000000ffffffffffffff7f0000000000000000;thread:42;"
            ),
            ResponseResult::Ok
        );

        // Save/restore register state
        assert!(invalid(server.handle_packet_payload("QSaveRegisterState")));
        assert_eq!(
            server.handle_packet_payload("QSaveRegisterState;thread:42"),
            response("1")
        );
        assert_eq!(
            server.handle_packet_payload("QSaveRegisterState;thread:42"),
            response("2")
        );
        assert_eq!(
            server.handle_packet_payload("QRestoreRegisterState:3;thread:42"),
            ResponseResult::Error(ErrorCode::E77)
        );
        assert_eq!(
            server.handle_packet_payload("QRestoreRegisterState:0;thread:42"),
            ResponseResult::Error(ErrorCode::E77)
        );
        assert_eq!(
            server.handle_packet_payload("QRestoreRegisterState:1;thread:42"),
            ResponseResult::Ok
        );
        assert_eq!(
            server.handle_packet_payload("QRestoreRegisterState:1;thread:42"),
            ResponseResult::Error(ErrorCode::E77)
        );
        assert_eq!(
            server.handle_packet_payload("QRestoreRegisterState:2;thread:42"),
            ResponseResult::Ok
        );
        assert_eq!(
            server.handle_packet_payload("QRestoreRegisterState:1;thread:42"),
            ResponseResult::Error(ErrorCode::E77)
        );
        assert!(invalid(
            server.handle_packet_payload("QRestoreRegisterState:;thread:42")
        ));
        assert!(invalid(server.handle_packet_payload(
            "QRestoreRegisterState:348237480297082374820734082;thread:42"
        )));

        // Thread selection and pinning
        assert_eq!(server.handle_packet_payload("qC"), response("QCc"));
        assert_eq!(server.handle_packet_payload("Hg0"), ResponseResult::Ok);
        assert_eq!(server.handle_packet_payload("qC"), response("QCc"));
        assert_eq!(server.handle_packet_payload("Hg30"), ResponseResult::Ok);
        assert_eq!(server.handle_packet_payload("qC"), response("QC30"));
        assert_eq!(server.handle_packet_payload("Hg0"), ResponseResult::Ok);
        assert_eq!(server.handle_packet_payload("qC"), response("QCc"));
        assert_eq!(server.handle_packet_payload("Hg40"), ResponseResult::Ok);
        assert_eq!(server.handle_packet_payload("qC"), response("QC40"));
        assert_eq!(server.handle_packet_payload("Hg-1"), ResponseResult::Ok);
        assert_eq!(server.handle_packet_payload("qC"), response("QCc"));
        assert_eq!(server.handle_packet_payload("Hc40"), ResponseResult::Ok);
        assert_eq!(server.handle_packet_payload("Hc0"), ResponseResult::Ok);
        assert_eq!(server.handle_packet_payload("Hc-1"), ResponseResult::Ok);
        assert!(invalid(server.handle_packet_payload("Ha")));
        assert!(invalid(server.handle_packet_payload("Hc-")));
        assert!(invalid(server.handle_packet_payload("Hc-2")));
        assert_eq!(
            server.handle_packet_payload("T20"),
            ResponseResult::Error(ErrorCode::E16)
        );
        assert_eq!(server.handle_packet_payload("T405"), ResponseResult::Ok);
        assert!(invalid(server.handle_packet_payload("T")));

        // Continue/step
        assert_eq!(
            server.handle_packet_payload("c"),
            continue_entry(ThreadReference::All, None)
        );
        assert_eq!(
            server.handle_packet_payload("c0"),
            continue_entry(ThreadReference::All, Some(Address::from(0usize)))
        );
        assert_eq!(
            server.handle_packet_payload("c4000"),
            continue_entry(ThreadReference::All, Some(Address::from(0x4000usize)))
        );
        assert_eq!(server.handle_packet_payload("Hc40"), ResponseResult::Ok);
        assert_eq!(
            server.handle_packet_payload("c"),
            continue_entry(ThreadReference::Id(0x40), None)
        );
        assert!(invalid(server.handle_packet_payload("c=")));
        assert_eq!(
            server.handle_packet_payload("s"),
            step_entry(ThreadReference::Id(0x40), None)
        );
        assert_eq!(
            server.handle_packet_payload("s123456789ab"),
            step_entry(
                ThreadReference::Id(0x40),
                Some(Address::from(0x123456789abusize))
            )
        );
        assert_eq!(server.handle_packet_payload("Hc0"), ResponseResult::Ok);
        assert_eq!(
            server.handle_packet_payload("s"),
            step_entry(ThreadReference::Id(0xc), None)
        );
        assert_eq!(server.handle_packet_payload("Hc-1"), ResponseResult::Ok);
        assert_eq!(
            server.handle_packet_payload("s"),
            step_entry(ThreadReference::Id(0xc), None)
        );

        // vCont
        assert_eq!(
            server.handle_packet_payload("vCont;c"),
            continue_entry(ThreadReference::All, None)
        );
        assert_eq!(
            server.handle_packet_payload("vCont;s"),
            step_entry(ThreadReference::Id(0xc), None)
        );
        assert_eq!(
            server.handle_packet_payload("vCont;c:404"),
            ResponseResult::Resume(
                vec![ThreadResumeEntry {
                    thread: ThreadReference::Id(0x404),
                    action: ThreadResumeAction::Continue,
                    address: None,
                }],
                ThreadResumeAction::Stop
            )
        );
        assert_eq!(
            server.handle_packet_payload("vCont;s:20"),
            ResponseResult::Resume(
                vec![ThreadResumeEntry {
                    thread: ThreadReference::Id(0x20),
                    action: ThreadResumeAction::Step,
                    address: None,
                }],
                ThreadResumeAction::Stop
            )
        );
        assert_eq!(
            server.handle_packet_payload("vCont;c;s:20"),
            ResponseResult::Resume(
                vec![ThreadResumeEntry {
                    thread: ThreadReference::Id(0x20),
                    action: ThreadResumeAction::Step,
                    address: None,
                }],
                ThreadResumeAction::Continue
            )
        );
        assert_eq!(
            server.handle_packet_payload("vCont;s;c:40"),
            ResponseResult::Resume(
                vec![ThreadResumeEntry {
                    thread: ThreadReference::Id(0x40),
                    action: ThreadResumeAction::Continue,
                    address: None,
                }],
                ThreadResumeAction::Step
            )
        );
        assert!(invalid(server.handle_packet_payload("vCont")));
        assert!(invalid(server.handle_packet_payload("vCont;")));
        assert!(invalid(server.handle_packet_payload("vCont;a")));
        assert!(invalid(server.handle_packet_payload("vCont;c:")));

        // vAttach
        assert_eq!(
            server.handle_packet_payload("vAttach;12345"),
            ResponseResult::ThreadStopReply
        );
        assert!(invalid(server.handle_packet_payload("vAttach;")));

        // Stop info requests
        assert_eq!(
            server.handle_packet_payload("QListThreadsInStopReply"),
            ResponseResult::Ok
        );
        assert_eq!(
            server.handle_packet_payload("qThreadStopInfo12"),
            ResponseResult::StopReplyForThread(0x12)
        );
        assert_eq!(
            server.handle_packet_payload("qThreadStopInfo0"),
            ResponseResult::StopReplyForThread(0)
        );
        assert!(invalid(server.handle_packet_payload("qThreadStopInfo")));

        // Queries
        assert_eq!(server.handle_packet_payload("qShlibInfoAddr"), response("1013"));
        assert_eq!(server.handle_packet_payload("qSymbol::"), ResponseResult::Ok);
        assert_eq!(
            server.handle_packet_payload(
                "qSymbol:64697370617463685f71756575655f6f666673657473"
            ),
            ResponseResult::Ok
        );
        assert_eq!(
            server.handle_packet_payload("qEcho:test"),
            response("qEcho:test")
        );
        let ResponseResult::Response(host_info) = server.handle_packet_payload("qHostInfo")
        else {
            panic!("host info expected");
        };
        for key in ["cputype:", "cpusubtype:", "ostype:", "endian:", "ptrsize:"] {
            assert!(host_info.contains(key), "missing {key} in {host_info}");
        }
        let ResponseResult::Response(process_info) =
            server.handle_packet_payload("qProcessInfo")
        else {
            panic!("process info expected");
        };
        for key in [
            "pid:12345",
            "parent-pid:",
            "real-uid:",
            "real-gid:",
            "effective-uid:",
            "effective-gid:",
            "cputype:",
            "endian:",
            "ptrsize:",
        ] {
            assert!(process_info.contains(key), "missing {key} in {process_info}");
        }
        assert_eq!(
            server.handle_packet_payload("?"),
            ResponseResult::ThreadStopReply
        );

        // Kill/detach
        assert_eq!(
            server.handle_packet_payload("D"),
            ResponseResult::Exit(Some("OK".into()))
        );
        assert_eq!(
            server.handle_packet_payload("k"),
            ResponseResult::Exit(Some("X09".into()))
        );
    }

    #[test]
    fn test_process_info_without_attach_fails() {
        let mut sink = SinkWriter::default();
        let mut server = DebugServer::new(Box::new(MockDebugger::default()), &mut sink);
        assert_eq!(
            server.handle_packet_payload("qProcessInfo"),
            ResponseResult::Error(ErrorCode::E68)
        );
    }

    fn expected_register_dump() -> String {
        (0..=0x14)
            .map(|number| format!("{number:02x}:7856341278563412;"))
            .collect()
    }

    fn stop_mock(stop_infos: Vec<(ThreadId, ThreadStopInfo)>) -> MockDebugger {
        MockDebugger {
            stop_infos: RefCell::new(VecDeque::from(stop_infos)),
            fixed_register_read: Some(0x1234567812345678),
            ..MockDebugger::default()
        }
    }

    fn plain_stop(signal_number: u8) -> ThreadStopInfo {
        ThreadStopInfo {
            signal_number,
            dispatch_queue_address: None,
            exception: None,
        }
    }

    #[test]
    fn test_stop_reply_formatting() {
        let interrupt_counter = Arc::new(AtomicUsize::new(0));
        let mut mock = stop_mock(vec![
            (0xc, plain_stop(5)),
            (0x689, plain_stop(0x20)),
            (
                0xc,
                ThreadStopInfo {
                    signal_number: 5,
                    dispatch_queue_address: Some(Address::from(0xabcusize)),
                    exception: Some(StopExceptionDetail {
                        exception_type: 0x40,
                        data: vec![0x2, 0xFFFF],
                    }),
                },
            ),
            (0xc, plain_stop(0xf0)),
            (0xc, plain_stop(5)),
        ]);
        mock.interrupt_counter = Arc::clone(&interrupt_counter);
        let mut sink = SinkWriter::default();
        let mut server = DebugServer::new(Box::new(mock), &mut sink);

        assert_eq!(
            server.handle_stop_reply(ResponseResult::ThreadStopReply),
            response(&format!("T05thread:c;{}", expected_register_dump()))
        );
        assert_eq!(
            server.handle_stop_reply(ResponseResult::StopReplyForThread(0x689)),
            response(&format!("T20thread:689;{}", expected_register_dump()))
        );
        assert_eq!(
            server.handle_stop_reply(ResponseResult::ThreadStopReply),
            response(&format!(
                "T05thread:c;qaddr:abc;{}metype:40;mecount:2;medata:2;medata:ffff;",
                expected_register_dump()
            ))
        );
        assert_eq!(
            server.handle_packet_payload("QListThreadsInStopReply"),
            ResponseResult::Ok
        );
        assert_eq!(
            server.handle_stop_reply(ResponseResult::ThreadStopReply),
            response(&format!(
                "Tf0thread:c;threads:c;thread-pcs:deadbeef;{}",
                expected_register_dump()
            ))
        );

        // An interrupt packet triggers the interrupt path and synthesizes
        // a stop reply.
        assert_eq!(interrupt_counter.load(Ordering::SeqCst), 0);
        assert_eq!(
            server.process_packets(&[0x03]).unwrap(),
            SessionOutcome::Pending
        );
        assert_eq!(interrupt_counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_session_acks_and_nacks() {
        let mut sink = SinkWriter::default();
        {
            let mut server = DebugServer::new(Box::new(MockDebugger::default()), &mut sink);
            // qEcho:hi -> ack plus framed echo.
            assert_eq!(
                server.process_packets(b"$qEcho:hi#fb").unwrap(),
                SessionOutcome::Pending
            );
        }
        assert_eq!(sink.sent, b"+$qEcho:hi#fb".to_vec());

        let mut sink = SinkWriter::default();
        {
            let mut server = DebugServer::new(Box::new(MockDebugger::default()), &mut sink);
            assert_eq!(
                server.process_packets(b"$qEcho:hi#00").unwrap(),
                SessionOutcome::Pending
            );
        }
        // Bad checksum earns a NACK and nothing else.
        assert_eq!(sink.sent, b"-".to_vec());
    }

    #[test]
    fn test_no_ack_mode_switch_happens_after_the_ok() {
        let mut sink = SinkWriter::default();
        {
            let mut server = DebugServer::new(Box::new(MockDebugger::default()), &mut sink);
            assert_eq!(
                server.process_packets(b"$QStartNoAckMode#b0").unwrap(),
                SessionOutcome::Pending
            );
            // The next response uses the no-ack framing: no '+', '#00'.
            assert_eq!(
                server.process_packets(b"$qEcho:x#a2").unwrap(),
                SessionOutcome::Pending
            );
        }
        assert_eq!(sink.sent, b"+$OK#9a$qEcho:x#00".to_vec());
    }

    #[test]
    fn test_resume_retains_pending_packets() {
        let mut sink = SinkWriter::default();
        let mut server = DebugServer::new(Box::new(MockDebugger::default()), &mut sink);
        let outcome = server.process_packets(b"$c#63$qC#b4").unwrap();
        assert!(matches!(outcome, SessionOutcome::Resume(..)));
        // The qC packet was kept and is handled on the next call.
        assert_eq!(
            server.process_packets(&[]).unwrap(),
            SessionOutcome::Pending
        );
    }

    #[test]
    fn test_interrupt_after_resume_forces_exit() {
        let mut sink = SinkWriter::default();
        let mut server = DebugServer::new(Box::new(MockDebugger::default()), &mut sink);
        assert_eq!(
            server.process_packets(b"$c#63\x03").unwrap(),
            SessionOutcome::Exit
        );
    }
}
