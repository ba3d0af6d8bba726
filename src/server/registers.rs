//! Register centric command handlers of the debug server: single register
//! and whole context reads/writes, register info queries, the saved
//! register state store, and the register dump of stop replies.

use std::collections::HashMap;

use tracing::warn;

use crate::protocol::{hex_string, PacketParser};
use crate::registers::map::RegisterMap;
use crate::registers::REGISTER_SET_GPR;
use crate::ThreadId;

use super::{DebugServerState, ErrorCode, ResponseResult};

/// Register table plus the per-session register state of the server
pub(super) struct RegisterHandlingState {
    pub(super) map: RegisterMap,
    /// Scratch buffer for register and context values, sized to the
    /// debugger's register context
    value_storage: Vec<u8>,
    saved_registers: HashMap<u64, Vec<u8>>,
    save_register_id: u64,
}

impl RegisterHandlingState {
    pub(super) fn new(register_context_size: usize) -> Self {
        Self {
            map: RegisterMap::build(),
            value_storage: vec![0u8; register_context_size],
            saved_registers: HashMap::new(),
            save_register_id: 1,
        }
    }
}

// p register
pub(super) fn handle_register_read(server: &mut DebugServerState, payload: &str) -> ResponseResult {
    let mut parser = PacketParser::with_offset(payload, 1);
    let Some(register_number) = parser.consume_hex_u64() else {
        return ResponseResult::Invalid("Invalid register number".into());
    };
    let Some(thread_id) = server.extract_thread_id(payload) else {
        return ResponseResult::Invalid("No thread specified".into());
    };
    let Some(entry) = server.register_state.map.get(register_number as usize) else {
        warn!("unknown register number requested: {register_number}");
        return ResponseResult::Error(ErrorCode::E47);
    };
    let size = entry.descriptor.size;
    let (register_id, register_set_id) = (entry.descriptor.id, entry.descriptor.set);
    match server.debugger.get_register_value_for_thread(
        thread_id,
        register_id,
        register_set_id,
        &mut server.register_state.value_storage,
    ) {
        Ok(length) => {
            debug_assert_eq!(length, size);
            ResponseResult::Response(hex_string(&server.register_state.value_storage[..length]))
        }
        Err(_) => ResponseResult::Error(ErrorCode::E32),
    }
}

// P register = value
pub(super) fn handle_register_write(server: &mut DebugServerState, payload: &str) -> ResponseResult {
    let mut parser = PacketParser::with_offset(payload, 1);
    let Some(register_number) = parser.consume_hex_u64() else {
        return ResponseResult::Invalid("Invalid register number".into());
    };
    if !parser.consume_if_present('=') {
        return ResponseResult::Invalid("Missing equals sign".into());
    }
    let Some(entry) = server.register_state.map.get(register_number as usize) else {
        warn!("unknown register number requested: {register_number}");
        return ResponseResult::Error(ErrorCode::E47);
    };
    let Some(value) = parser.read_hex_bytes_sized(entry.descriptor.size) else {
        return ResponseResult::Invalid("Invalid register value".into());
    };
    let (register_id, register_set_id) = (entry.descriptor.id, entry.descriptor.set);
    let Some(thread_id) = server.extract_thread_id(payload) else {
        return ResponseResult::Invalid("No thread specified".into());
    };
    match server.debugger.set_register_value_for_thread(
        thread_id,
        register_id,
        register_set_id,
        &value,
    ) {
        Ok(()) => ResponseResult::Ok,
        Err(_) => ResponseResult::Error(ErrorCode::E32),
    }
}

// g - whole register context read
pub(super) fn handle_gp_registers_read(
    server: &mut DebugServerState,
    payload: &str,
) -> ResponseResult {
    let Some(thread_id) = server.extract_thread_id(payload) else {
        return ResponseResult::Invalid("No thread specified".into());
    };
    match server
        .debugger
        .get_register_context_for_thread(thread_id, &mut server.register_state.value_storage)
    {
        Ok(length) => {
            debug_assert_eq!(length, server.debugger.register_context_size());
            ResponseResult::Response(hex_string(&server.register_state.value_storage[..length]))
        }
        Err(_) => ResponseResult::Error(ErrorCode::E74),
    }
}

// G context-value - whole register context write
pub(super) fn handle_gp_registers_write(
    server: &mut DebugServerState,
    payload: &str,
) -> ResponseResult {
    let mut parser = PacketParser::with_offset(payload, 1);
    let Some(value) = parser.read_hex_bytes_sized(server.debugger.register_context_size()) else {
        return ResponseResult::Invalid("Invalid register context value".into());
    };
    let Some(thread_id) = server.extract_thread_id(payload) else {
        return ResponseResult::Invalid("No thread specified".into());
    };
    match server
        .debugger
        .set_register_context_for_thread(thread_id, &value)
    {
        Ok(()) => ResponseResult::Ok,
        Err(_) => ResponseResult::Error(ErrorCode::E55),
    }
}

// QSaveRegisterState
pub(super) fn handle_q_save_register_state(
    server: &mut DebugServerState,
    payload: &str,
) -> ResponseResult {
    let Some(thread_id) = server.extract_thread_id(payload) else {
        return ResponseResult::Invalid("No thread specified".into());
    };
    let mut storage = vec![0u8; server.debugger.register_context_size()];
    match server
        .debugger
        .get_register_context_for_thread(thread_id, &mut storage)
    {
        Ok(length) => {
            debug_assert_eq!(length, storage.len());
            let save_id = server.register_state.save_register_id;
            // Ids wrap back to 1, 0 is never handed out.
            server.register_state.save_register_id =
                server.register_state.save_register_id.checked_add(1).unwrap_or(1);
            server.register_state.saved_registers.insert(save_id, storage);
            ResponseResult::Response(format!("{save_id}"))
        }
        Err(_) => ResponseResult::Error(ErrorCode::E75),
    }
}

// QRestoreRegisterState:save-id
pub(super) fn handle_q_restore_register_state(
    server: &mut DebugServerState,
    payload: &str,
) -> ResponseResult {
    let mut parser = PacketParser::with_offset(payload, "QRestoreRegisterState:".len());
    let Some(save_id) = parser.consume_decimal_u64() else {
        return ResponseResult::Invalid("Invalid save ID".into());
    };
    let Some(thread_id) = server.extract_thread_id(payload) else {
        return ResponseResult::Invalid("No thread specified".into());
    };
    // Restoring consumes the snapshot; a second restore of the same id
    // must fail.
    let Some(saved) = server.register_state.saved_registers.remove(&save_id) else {
        return ResponseResult::Error(ErrorCode::E77);
    };
    match server
        .debugger
        .set_register_context_for_thread(thread_id, &saved)
    {
        Ok(()) => ResponseResult::Ok,
        Err(_) => ResponseResult::Error(ErrorCode::E77),
    }
}

// qRegisterInfo - describe one register of the register map
pub(super) fn handle_q_register_info(
    server: &mut DebugServerState,
    payload: &str,
) -> ResponseResult {
    let mut parser = PacketParser::with_offset(payload, "qRegisterInfo".len());
    let Some(register_number) = parser.consume_hex_u64() else {
        return ResponseResult::Invalid("Invalid register number".into());
    };
    let Some(entry) = server.register_state.map.get(register_number as usize) else {
        // No more registers.
        return ResponseResult::Error(ErrorCode::E45);
    };

    let descriptor = entry.descriptor;
    let mut response = String::new();
    response.push_str(&format!("name:{};", descriptor.name));
    if let Some(alt_name) = descriptor.alt_name {
        response.push_str(&format!("alt-name:{alt_name};"));
    }
    response.push_str(&format!("bitsize:{};", descriptor.size * 8));
    response.push_str(&format!("offset:{};", entry.offset));
    response.push_str(&format!("encoding:{};", descriptor.encoding.wire_name()));
    response.push_str(&format!("format:{};", descriptor.format.wire_name()));
    if let Some(set_name) = server.register_state.map.set_name(descriptor.set) {
        response.push_str(&format!("set:{set_name};"));
    }
    if let Some(ehframe) = descriptor.ehframe {
        response.push_str(&format!("ehframe:{ehframe};"));
    }
    if let Some(dwarf) = descriptor.dwarf {
        response.push_str(&format!("dwarf:{dwarf};"));
    }
    if let Some(generic) = descriptor.generic {
        response.push_str(&format!("generic:{};", generic.wire_name()));
    }
    if !entry.value_register_numbers.is_empty() {
        let list: Vec<String> = entry
            .value_register_numbers
            .iter()
            .map(|number| format!("{number:x}"))
            .collect();
        response.push_str(&format!("container-regs:{};", list.join(",")));
    }
    if !entry.invalidate_register_numbers.is_empty() {
        let list: Vec<String> = entry
            .invalidate_register_numbers
            .iter()
            .map(|number| format!("{number:x}"))
            .collect();
        response.push_str(&format!("invalidate-regs:{};", list.join(",")));
    }
    ResponseResult::Response(response)
}

/// Appends the `NN:hexbytes;` register dump to a stop reply
///
/// Only general purpose registers that own storage are dumped; partial
/// views would repeat bytes the debugger already has.
pub(super) fn emit_stop_info_registers(
    server: &mut DebugServerState,
    thread_id: ThreadId,
    dest: &mut String,
) -> crate::errors::Result<()> {
    for index in 0..server.register_state.map.len() {
        let entry = server.register_state.map.get(index).expect("indexed in range");
        if entry.descriptor.set != REGISTER_SET_GPR || entry.descriptor.is_contained() {
            continue;
        }
        debug_assert!(entry.number <= usize::from(u8::MAX));
        let (number, register_id, register_set_id) =
            (entry.number, entry.descriptor.id, entry.descriptor.set);
        let length = server.debugger.get_register_value_for_thread(
            thread_id,
            register_id,
            register_set_id,
            &mut server.register_state.value_storage,
        )?;
        dest.push_str(&format!(
            "{number:02x}:{};",
            hex_string(&server.register_state.value_storage[..length])
        ));
    }
    Ok(())
}
