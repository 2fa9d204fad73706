#![allow(clippy::missing_safety_doc)]

use std::ptr;
use std::time::Duration;

use bus_arbiter_core::{
    Admission, ArbiterCfg, ArbiterError, ArbiterSnapshot, BusArbiter, Direction, FairnessPolicy, Priority,
    Ticket,
};

/// FFI ABI version for bus_arbiter_ffi.
///
/// Bump this when any `#[repr(C)]` struct layout or exported function signature changes.
pub const BUS_ARBITER_FFI_VERSION: u32 = 2;

#[no_mangle]
pub extern "C" fn bus_arbiter_ffi_version() -> u32 {
    BUS_ARBITER_FFI_VERSION
}

/// Return codes shared by every fallible export. Arbiter failures use
/// [`ArbiterError::code`], which never overlaps these.
pub const BUS_OK: i32 = 0;
pub const BUS_ERR_NULL: i32 = -1;
pub const BUS_ERR_INVALID_ARG: i32 = -2;
pub const BUS_ERR_BAD_MAGIC: i32 = -8;
pub const BUS_ERR_BAD_VERSION: i32 = -9;
/// The handle still has slots held or requests queued.
pub const BUS_ERR_BUSY: i32 = -11;

// Snapshot wire format identification.
pub const SNAP_MAGIC: u32 = 0x3153_5542; // "BUS1" little-endian
pub const SNAP_VERSION: u32 = 1;

/// Byte length of a version 1 snapshot.
pub const SNAP_LEN: usize = 4 * 14 + 8 * 11;

/// Opaque handle exposed over FFI. Safe to share between threads.
pub struct BusArbiterHandle {
    inner: BusArbiter,
}

/// Arbiter cfg for FFI.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct BusCfg {
    pub capacity: u32,
    /// 0 = alternate, 1 = oldest-first.
    pub fairness: u8,
    pub yield_to_opposite: u8,
    pub elevated_streak_limit: u32,
}

/// Cumulative counters plus the current occupancy.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BusStats {
    pub capacity: u32,
    pub active_count: u32,
    /// -1 while idle, otherwise the direction code.
    pub current_direction: i32,
    pub waiting: u32,
    pub admissions: u64,
    pub immediate_admissions: u64,
    pub queued_admissions: u64,
    pub outbound_admissions: u64,
    pub inbound_admissions: u64,
    pub elevated_admissions: u64,
    pub normal_admissions: u64,
    pub cycles: u64,
    pub direction_switches: u64,
    pub withdrawn: u64,
    pub rejected_releases: u64,
    pub peak_active: u32,
}

/// Owned byte buffer (for snapshot).
#[repr(C)]
pub struct BusBytes {
    pub ptr: *mut u8,
    pub len: usize,
}

#[no_mangle]
pub extern "C" fn bus_arbiter_cfg_default() -> BusCfg {
    let d = ArbiterCfg::default();
    BusCfg {
        capacity: d.capacity as u32,
        fairness: fairness_to_ffi(d.fairness),
        yield_to_opposite: d.yield_to_opposite as u8,
        elevated_streak_limit: d.elevated_streak_limit,
    }
}

fn fairness_to_ffi(f: FairnessPolicy) -> u8 {
    match f {
        FairnessPolicy::Alternate => 0,
        FairnessPolicy::OldestFirst => 1,
    }
}

fn cfg_from_ffi(c: BusCfg) -> Option<ArbiterCfg> {
    let fairness = match c.fairness {
        0 => FairnessPolicy::Alternate,
        1 => FairnessPolicy::OldestFirst,
        _ => return None,
    };
    Some(ArbiterCfg {
        capacity: c.capacity as usize,
        fairness,
        elevated_streak_limit: c.elevated_streak_limit,
        yield_to_opposite: c.yield_to_opposite != 0,
    })
}

fn class_from_ffi(direction: u8, priority: u8) -> Option<(Direction, Priority)> {
    Some((Direction::from_u8(direction)?, Priority::from_u8(priority)?))
}

/// Create a new arbiter handle. Returns null for a zero capacity or an
/// unknown fairness code.
#[no_mangle]
pub extern "C" fn bus_arbiter_new(cfg: BusCfg) -> *mut BusArbiterHandle {
    let Some(cfg) = cfg_from_ffi(cfg) else {
        return ptr::null_mut();
    };
    match BusArbiter::new(cfg) {
        Ok(inner) => Box::into_raw(Box::new(BusArbiterHandle { inner })),
        Err(e) => {
            tracing::warn!(error = %e, "bus_arbiter_new rejected cfg");
            ptr::null_mut()
        }
    }
}

/// Free a handle. A handle with slots held or requests queued is left alive
/// and `BUS_ERR_BUSY` is returned. No call may run on the handle concurrently.
#[no_mangle]
pub unsafe extern "C" fn bus_arbiter_free(h: *mut BusArbiterHandle) -> i32 {
    if h.is_null() {
        return BUS_OK;
    }
    if let Ok(false) = (*h).inner.is_idle() {
        tracing::warn!("bus_arbiter_free refused: arbiter still in use");
        return BUS_ERR_BUSY;
    }
    drop(Box::from_raw(h));
    BUS_OK
}

unsafe fn finish(res: Result<Admission, ArbiterError>, out_ticket: *mut u64) -> i32 {
    match res {
        Ok(admission) => {
            if !out_ticket.is_null() {
                *out_ticket = admission.ticket().0;
            }
            BUS_OK
        }
        Err(e) => e.code(),
    }
}

/// Block until a slot is granted. `out_ticket` may be null.
#[no_mangle]
pub unsafe extern "C" fn bus_arbiter_acquire(
    h: *const BusArbiterHandle,
    direction: u8,
    priority: u8,
    out_ticket: *mut u64,
) -> i32 {
    if h.is_null() {
        return BUS_ERR_NULL;
    }
    let Some((d, p)) = class_from_ffi(direction, priority) else {
        return BUS_ERR_INVALID_ARG;
    };
    finish((*h).inner.acquire(d, p), out_ticket)
}

#[no_mangle]
pub unsafe extern "C" fn bus_arbiter_try_acquire(
    h: *const BusArbiterHandle,
    direction: u8,
    priority: u8,
    out_ticket: *mut u64,
) -> i32 {
    if h.is_null() {
        return BUS_ERR_NULL;
    }
    let Some((d, p)) = class_from_ffi(direction, priority) else {
        return BUS_ERR_INVALID_ARG;
    };
    finish((*h).inner.try_acquire(d, p), out_ticket)
}

#[no_mangle]
pub unsafe extern "C" fn bus_arbiter_acquire_timeout(
    h: *const BusArbiterHandle,
    direction: u8,
    priority: u8,
    timeout_micros: u64,
    out_ticket: *mut u64,
) -> i32 {
    if h.is_null() {
        return BUS_ERR_NULL;
    }
    let Some((d, p)) = class_from_ffi(direction, priority) else {
        return BUS_ERR_INVALID_ARG;
    };
    let timeout = Duration::from_micros(timeout_micros);
    finish((*h).inner.acquire_timeout(d, p, timeout), out_ticket)
}

#[no_mangle]
pub unsafe extern "C" fn bus_arbiter_release(h: *const BusArbiterHandle, direction: u8, priority: u8) -> i32 {
    if h.is_null() {
        return BUS_ERR_NULL;
    }
    let Some((d, p)) = class_from_ffi(direction, priority) else {
        return BUS_ERR_INVALID_ARG;
    };
    match (*h).inner.release(d, p) {
        Ok(()) => BUS_OK,
        Err(e) => e.code(),
    }
}

/// Release the slot granted under `ticket`, as written to `out_ticket` by
/// the acquire calls. A second release of the same ticket fails with the
/// stale-ticket code even while other tasks of its class hold slots.
#[no_mangle]
pub unsafe extern "C" fn bus_arbiter_release_ticket(h: *const BusArbiterHandle, ticket: u64) -> i32 {
    if h.is_null() {
        return BUS_ERR_NULL;
    }
    match (*h).inner.release_ticket(Ticket(ticket)) {
        Ok(()) => BUS_OK,
        Err(e) => e.code(),
    }
}

fn stats_from(snap: &ArbiterSnapshot) -> BusStats {
    let s = &snap.stats;
    BusStats {
        capacity: snap.capacity as u32,
        active_count: snap.active_count as u32,
        current_direction: snap.current_direction.map(|d| d.as_u8() as i32).unwrap_or(-1),
        waiting: snap.waiting.total() as u32,
        admissions: s.admissions,
        immediate_admissions: s.immediate_admissions,
        queued_admissions: s.queued_admissions,
        outbound_admissions: s.outbound_admissions,
        inbound_admissions: s.inbound_admissions,
        elevated_admissions: s.elevated_admissions,
        normal_admissions: s.normal_admissions,
        cycles: s.cycles,
        direction_switches: s.direction_switches,
        withdrawn: s.withdrawn,
        rejected_releases: s.rejected_releases,
        peak_active: s.peak_active as u32,
    }
}

#[no_mangle]
pub unsafe extern "C" fn bus_arbiter_stats(h: *const BusArbiterHandle, out: *mut BusStats) -> i32 {
    if h.is_null() || out.is_null() {
        return BUS_ERR_NULL;
    }
    match (*h).inner.snapshot() {
        Ok(snap) => {
            *out = stats_from(&snap);
            BUS_OK
        }
        Err(e) => e.code(),
    }
}

fn direction_word(d: Option<Direction>) -> u32 {
    d.map(|d| d.as_u8() as u32).unwrap_or(u32::MAX)
}

/// Snapshot format (binary, little-endian):
/// [u32 magic = "BUS1"][u32 version = 1]
/// [u32 capacity][u32 active_count][u32 current_direction][u32 last_served_direction]
///   (direction words are u32::MAX when unset)
/// [u32 waiting x4][u32 held x4]  cells: outbound-elevated, outbound-normal, inbound-elevated, inbound-normal
/// [u64 admissions][u64 immediate][u64 queued][u64 outbound][u64 inbound][u64 elevated][u64 normal]
/// [u64 cycles][u64 direction_switches][u64 withdrawn][u64 rejected_releases]
pub fn encode_snapshot(snap: &ArbiterSnapshot) -> Vec<u8> {
    let mut buf: Vec<u8> = Vec::with_capacity(SNAP_LEN);
    let put32 = |buf: &mut Vec<u8>, v: u32| buf.extend_from_slice(&v.to_le_bytes());

    put32(&mut buf, SNAP_MAGIC);
    put32(&mut buf, SNAP_VERSION);
    put32(&mut buf, snap.capacity as u32);
    put32(&mut buf, snap.active_count as u32);
    put32(&mut buf, direction_word(snap.current_direction));
    put32(&mut buf, direction_word(snap.last_served_direction));
    for cells in [&snap.waiting, &snap.held] {
        for d in Direction::ALL {
            for p in Priority::ALL {
                put32(&mut buf, cells.get(d, p) as u32);
            }
        }
    }

    let s = &snap.stats;
    for v in [
        s.admissions,
        s.immediate_admissions,
        s.queued_admissions,
        s.outbound_admissions,
        s.inbound_admissions,
        s.elevated_admissions,
        s.normal_admissions,
        s.cycles,
        s.direction_switches,
        s.withdrawn,
        s.rejected_releases,
    ] {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

/// Header fields of an encoded snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub capacity: u32,
    pub active_count: u32,
    pub current_direction: Option<Direction>,
    pub last_served_direction: Option<Direction>,
}

/// Check magic, version and length, and read the header. Errors are the
/// same return codes the C ABI uses.
pub fn decode_snapshot_header(data: &[u8]) -> Result<SnapshotHeader, i32> {
    let mut i = 0usize;
    let read_u32 = |data: &[u8], i: &mut usize| -> Option<u32> {
        if *i + 4 > data.len() {
            return None;
        }
        let v = u32::from_le_bytes(data[*i..*i + 4].try_into().ok()?);
        *i += 4;
        Some(v)
    };

    let magic = read_u32(data, &mut i).ok_or(BUS_ERR_INVALID_ARG)?;
    if magic != SNAP_MAGIC {
        return Err(BUS_ERR_BAD_MAGIC);
    }
    let ver = read_u32(data, &mut i).ok_or(BUS_ERR_INVALID_ARG)?;
    if ver != SNAP_VERSION {
        return Err(BUS_ERR_BAD_VERSION);
    }
    if data.len() != SNAP_LEN {
        return Err(BUS_ERR_INVALID_ARG);
    }

    let mut words = [0u32; 4];
    for w in &mut words {
        *w = read_u32(data, &mut i).ok_or(BUS_ERR_INVALID_ARG)?;
    }
    let direction = |w: u32| -> Result<Option<Direction>, i32> {
        if w == u32::MAX {
            return Ok(None);
        }
        u8::try_from(w)
            .ok()
            .and_then(Direction::from_u8)
            .map(Some)
            .ok_or(BUS_ERR_INVALID_ARG)
    };

    Ok(SnapshotHeader {
        capacity: words[0],
        active_count: words[1],
        current_direction: direction(words[2])?,
        last_served_direction: direction(words[3])?,
    })
}

/// Returned buffer must be freed with `bus_arbiter_bytes_free`.
#[no_mangle]
pub unsafe extern "C" fn bus_arbiter_snapshot(h: *const BusArbiterHandle) -> BusBytes {
    if h.is_null() {
        return BusBytes { ptr: ptr::null_mut(), len: 0 };
    }
    let snap = match (*h).inner.snapshot() {
        Ok(snap) => snap,
        Err(e) => {
            tracing::warn!(error = %e, "bus_arbiter_snapshot failed");
            return BusBytes { ptr: ptr::null_mut(), len: 0 };
        }
    };

    let mut boxed = encode_snapshot(&snap).into_boxed_slice();
    let ptr = boxed.as_mut_ptr();
    let len = boxed.len();
    std::mem::forget(boxed);

    BusBytes { ptr, len }
}

/// Validate a snapshot buffer. Returns `BUS_OK`, `BUS_ERR_BAD_MAGIC`,
/// `BUS_ERR_BAD_VERSION`, or `BUS_ERR_INVALID_ARG` for a truncated buffer.
#[no_mangle]
pub unsafe extern "C" fn bus_arbiter_snapshot_validate(bytes: *const u8, len: usize) -> i32 {
    if bytes.is_null() {
        return BUS_ERR_NULL;
    }
    let data = std::slice::from_raw_parts(bytes, len);
    match decode_snapshot_header(data) {
        Ok(_) => BUS_OK,
        Err(rc) => rc,
    }
}

#[no_mangle]
pub unsafe extern "C" fn bus_arbiter_bytes_free(b: BusBytes) {
    if !b.ptr.is_null() {
        let slice_ptr = std::ptr::slice_from_raw_parts_mut(b.ptr, b.len);
        drop(Box::from_raw(slice_ptr));
    }
}
