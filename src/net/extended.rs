use crate::net::bitbuf::{BitBuf, CodecError};

/// Extended-info attribute groups, as flag bits on an avatar record.
/// Sticky groups describe state a late-joining observer still needs
/// (appearance-altering attributes); transient groups are one-tick events.
pub const EXT_TRANSFORM: u32 = 0x01;
pub const EXT_RECOLOR: u32 = 0x02;
pub const EXT_ANIMATION: u32 = 0x04;
pub const EXT_GRAPHIC: u32 = 0x08;
pub const EXT_SAY: u32 = 0x10;
pub const EXT_HIT: u32 = 0x20;
pub const EXT_FACE_ENTITY: u32 = 0x40;
pub const EXT_FACE_COORD: u32 = 0x80;

/// Groups retransmitted to observers that promote an avatar after the
/// change happened.
pub const EXT_STICKY_MASK: u32 = EXT_TRANSFORM | EXT_RECOLOR | EXT_FACE_ENTITY;

/// Byte written in place of an avatar's attribute blocks when the record
/// vanished between queueing and serialization. The client reads it as an
/// empty update instead of desyncing every observer that shares the batch.
pub const NO_UPDATE_MARKER: u8 = 0x00;

/// Fixed client builds that need differently-shaped attribute encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientKind {
    #[default]
    Desktop,
    Mobile,
}

/// Per-entity attribute serializer, implemented outside this crate.
///
/// `encode` is invoked once per queued avatar per observer, in queue
/// order. `remaining` counts the entities that still follow in the batch
/// so implementations can pack terminator bits efficiently.
pub trait ExtendedInfoEncoder: Sync {
    /// Diff/stage hook, driven once per observed avatar before any
    /// observer serializes.
    fn prepare(&self, npc_index: u16, flags: u32) {
        let _ = (npc_index, flags);
    }

    fn encode(
        &self,
        client: ClientKind,
        out: &mut BitBuf,
        observer_index: u16,
        npc_index: u16,
        position: usize,
        remaining: usize,
        flags: u32,
    ) -> Result<(), CodecError>;
}

/// Encoder that emits the empty marker for every avatar. Stands in where
/// no attribute serializer is wired up (soak runs, protocol-only tests).
#[derive(Debug, Default)]
pub struct NullEncoder;

impl ExtendedInfoEncoder for NullEncoder {
    fn encode(
        &self,
        _client: ClientKind,
        out: &mut BitBuf,
        _observer_index: u16,
        _npc_index: u16,
        _position: usize,
        _remaining: usize,
        _flags: u32,
    ) -> Result<(), CodecError> {
        out.put_u8(NO_UPDATE_MARKER)
    }
}
