//! The on-wire trace format shared by the producer and the viewer.
//!
//! Every record is framed as `<type: u8> <length-prefix> <payload>`. The
//! length prefix is a single byte `L` for payloads shorter than 255 bytes;
//! otherwise the byte 255 followed by one little-endian machine word
//! holding the real length. All multi-byte scalars in payloads are
//! little-endian; strings are NUL-terminated and appear inline.
//!
//! Both sides of the tool agree on this module bit-exactly: the producer
//! writes through [`TraceWriter`] and the viewer reads through
//! [`RecordReader`].

mod reader;
mod writer;

pub use reader::{Record, RecordReader};
pub use writer::TraceWriter;

use crate::error::ContentError;
use serde::{Deserialize, Serialize};

/// Machine word: the width of a guest pointer.
pub type Word = u64;

/// Bytes per machine word on the wire.
pub const WORD_SIZE: usize = std::mem::size_of::<Word>();

/// Header magic, including its NUL terminator (11 bytes).
pub const MAGIC: &[u8; 11] = b"DATAGRIND1\0";

/// Wire format version written and expected.
pub const TRACE_VERSION: u8 = 1;

/// Endianness byte for little-endian payloads.
pub const ENDIAN_LITTLE: u8 = 0;

/// Upper bound on instructions per block definition; translated blocks
/// larger than this are split before encoding.
pub const MAX_BLOCK_INSTRS: usize = 255;

/// Record type tags.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// First record of every trace: magic, version, endianness, word size.
    Header = 0,
    /// Legacy single data read: size, address.
    Read = 1,
    /// Legacy single data write: size, address.
    Write = 2,
    /// Declare a typed range: address, size, type name, label.
    TrackRange = 3,
    /// Undeclare a range: address, size.
    UntrackRange = 4,
    /// Open a scoped event: label.
    StartEvent = 5,
    /// Close a scoped event: label.
    EndEvent = 6,
    /// Legacy single instruction fetch: size, address.
    Instr = 7,
    /// Announce a code object: text base address, filename.
    TextAvma = 8,
    /// Heap allocation: address, size, allocation stack.
    MallocBlock = 9,
    /// Heap free: address.
    FreeBlock = 10,
    /// Define a block's static shape: instructions and access slots.
    BbDef = 11,
    /// One dynamic execution of a block: context, live instruction
    /// count, concrete access addresses.
    BbRun = 12,
    /// Define a (definition, call stack) pair.
    Context = 13,
}

impl TryFrom<u8> for RecordKind {
    type Error = ContentError;

    fn try_from(value: u8) -> Result<Self, ContentError> {
        match value {
            0 => Ok(Self::Header),
            1 => Ok(Self::Read),
            2 => Ok(Self::Write),
            3 => Ok(Self::TrackRange),
            4 => Ok(Self::UntrackRange),
            5 => Ok(Self::StartEvent),
            6 => Ok(Self::EndEvent),
            7 => Ok(Self::Instr),
            8 => Ok(Self::TextAvma),
            9 => Ok(Self::MallocBlock),
            10 => Ok(Self::FreeBlock),
            11 => Ok(Self::BbDef),
            12 => Ok(Self::BbRun),
            13 => Ok(Self::Context),
            other => Err(ContentError::UnknownKind(other)),
        }
    }
}

/// Direction of a memory access.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessDir {
    /// Data load.
    Read,
    /// Data store.
    Write,
    /// Instruction fetch.
    Execute,
}

impl AccessDir {
    /// Wire encoding used inside BBDEF access slots.
    pub fn to_wire(self) -> u8 {
        match self {
            AccessDir::Read => 0,
            AccessDir::Write => 1,
            AccessDir::Execute => 2,
        }
    }

    /// Decode the BBDEF wire byte.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(AccessDir::Read),
            1 => Some(AccessDir::Write),
            2 => Some(AccessDir::Execute),
            _ => None,
        }
    }
}

impl std::fmt::Display for AccessDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessDir::Read => write!(f, "read"),
            AccessDir::Write => write!(f, "write"),
            AccessDir::Execute => write!(f, "execute"),
        }
    }
}

/// One instruction of a BBDEF payload: `(addr: W, size: u8)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInstr {
    pub addr: Word,
    pub size: u8,
}

/// One access slot of a BBDEF payload: `(dir, size, instr_index)`, with
/// `instr_index` naming the owning instruction within the definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockAccess {
    pub dir: AccessDir,
    pub size: u8,
    pub instr_index: u8,
}

/// Bytes a length prefix occupies for a payload of `len` bytes.
pub fn length_prefix_size(len: u64) -> usize {
    if len < 255 {
        1
    } else {
        1 + WORD_SIZE
    }
}
