//! Version 1 object headers, reduced to what the group index touches:
//! the link count and the symbol table message.
//!
//! Other messages are carried as opaque bytes so headers survive a round
//! trip and a cross-file copy unchanged.

use std::collections::HashMap;

use tracing::debug;

use crate::encoding::{Address, Decoder, Encoder, FileSizes};
use crate::error::FormatError;
use crate::file::File;
use crate::file_space::FileSpace;
use crate::link::ObjectType;
use crate::metadata_cache::{CacheEntry, MetadataCache};
use crate::property_list::CopyProps;
use crate::stab;
use crate::symbol_table::SymbolTableMessage;

/// NIL message (padding).
pub const MSG_NIL: u16 = 0x0000;
/// Datatype message.
pub const MSG_DATATYPE: u16 = 0x0003;
/// Data layout message.
pub const MSG_DATA_LAYOUT: u16 = 0x0008;
/// Symbol table message.
pub const MSG_SYMBOL_TABLE: u16 = 0x0011;

const OHDR_VERSION: u8 = 1;
const PREFIX_SIZE: usize = 16;
const MESSAGE_HEADER_SIZE: usize = 8;

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Maps source object header addresses to their copies.
pub type CopyMap = HashMap<Address, Address>;

/// One header message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderMessage {
    /// Message type.
    pub msg_type: u16,
    /// Message flags.
    pub flags: u8,
    /// Raw message body.
    pub data: Vec<u8>,
}

impl HeaderMessage {
    /// A symbol table message.
    pub fn symbol_table(msg: &SymbolTableMessage, sizes: FileSizes) -> Self {
        Self {
            msg_type: MSG_SYMBOL_TABLE,
            flags: 0,
            data: msg.to_bytes(sizes),
        }
    }
}

/// A loaded object header.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectHeader {
    /// Number of hard links to the object.
    pub link_count: u32,
    /// Messages in header order.
    pub messages: Vec<HeaderMessage>,
    chunk_size: usize,
}

impl ObjectHeader {
    /// New header; its chunk is sized to fit `messages` exactly.
    pub fn new(messages: Vec<HeaderMessage>, link_count: u32) -> Self {
        let chunk_size = messages
            .iter()
            .map(|m| MESSAGE_HEADER_SIZE + align8(m.data.len()))
            .sum();
        Self {
            link_count,
            messages,
            chunk_size,
        }
    }

    /// Allocate and cache a new header, returning its address.
    pub fn create(
        cache: &MetadataCache,
        messages: Vec<HeaderMessage>,
        link_count: u32,
    ) -> Result<Address, FormatError> {
        let header = ObjectHeader::new(messages, link_count);
        let addr = cache.allocate(header.disk_size(cache.sizes()))?;
        cache.insert(addr, header)?;
        debug!(addr, link_count, "ohdr.create");
        Ok(addr)
    }

    /// The symbol table message, if the header has one.
    pub fn symbol_table(&self, sizes: FileSizes) -> Result<Option<SymbolTableMessage>, FormatError> {
        self.messages
            .iter()
            .find(|m| m.msg_type == MSG_SYMBOL_TABLE)
            .map(|m| SymbolTableMessage::parse(&m.data, sizes))
            .transpose()
    }

    /// Classify the object from its messages.
    pub fn object_type(&self) -> ObjectType {
        let has = |t: u16| self.messages.iter().any(|m| m.msg_type == t);
        if has(MSG_SYMBOL_TABLE) {
            ObjectType::Group
        } else if has(MSG_DATA_LAYOUT) {
            ObjectType::Dataset
        } else if has(MSG_DATATYPE) {
            ObjectType::NamedDatatype
        } else {
            ObjectType::Unknown
        }
    }

    /// Probe the header at `addr` for a symbol table message.
    pub fn read_symbol_table(
        cache: &MetadataCache,
        addr: Address,
    ) -> Result<Option<SymbolTableMessage>, FormatError> {
        let header = cache.protect_read::<ObjectHeader>(addr, &())?;
        let result = header.symbol_table(cache.sizes());
        crate::error::finish(result, header.release())
    }

    /// Classify the object whose header is at `addr`.
    pub fn read_object_type(cache: &MetadataCache, addr: Address) -> Result<ObjectType, FormatError> {
        let header = cache.protect_read::<ObjectHeader>(addr, &())?;
        let obj_type = header.object_type();
        header.release()?;
        Ok(obj_type)
    }

    /// Current link count of the header at `addr`.
    pub fn read_link_count(cache: &MetadataCache, addr: Address) -> Result<u32, FormatError> {
        let header = cache.protect_read::<ObjectHeader>(addr, &())?;
        let count = header.link_count;
        header.release()?;
        Ok(count)
    }

    /// Add `delta` to the link count of the header at `addr`.
    ///
    /// When the count drops to zero the object is deleted: a group's symbol
    /// table is torn down first, then the header's own space is freed.
    pub fn adjust_link_count(file: &File, addr: Address, delta: i32) -> Result<u32, FormatError> {
        let cache = file.cache();
        let mut header = cache.protect_write::<ObjectHeader>(addr, &())?;
        let count = i64::from(header.link_count) + i64::from(delta);
        if count < 0 {
            return Err(FormatError::Corrupt(format!(
                "link count of object at {addr:#x} would become {count}"
            )));
        }
        header.link_count = count as u32;
        header.mark_dirty();
        if count > 0 {
            header.release()?;
            return Ok(count as u32);
        }

        let stab = header.symbol_table(cache.sizes())?;
        if let Some(stab) = stab {
            stab::delete(file, &stab)?;
        }
        header.mark_deleted(true);
        header.release()?;
        debug!(addr, "ohdr.delete");
        Ok(0)
    }

    /// Copy the object at `addr` in `src` into `dst`, recursing through
    /// groups. Objects already in `map` are linked again instead of copied.
    ///
    /// The returned header accounts for one new link to it.
    pub fn copy_to(
        src: &File,
        addr: Address,
        dst: &File,
        map: &mut CopyMap,
        props: &CopyProps,
    ) -> Result<Address, FormatError> {
        if let Some(&copied) = map.get(&addr) {
            ObjectHeader::adjust_link_count(dst, copied, 1)?;
            return Ok(copied);
        }

        let src_header = src.cache().protect_read::<ObjectHeader>(addr, &())?;
        let messages = src_header.messages.clone();
        src_header.release()?;

        let mut stabs = Vec::new();
        let mut dst_messages = Vec::with_capacity(messages.len());
        for msg in messages {
            if msg.msg_type == MSG_SYMBOL_TABLE {
                let src_stab = SymbolTableMessage::parse(&msg.data, src.sizes())?;
                let dst_stab = stab::copy_file(src, &src_stab, dst)?;
                dst_messages.push(HeaderMessage::symbol_table(&dst_stab, dst.sizes()));
                stabs.push((src_stab, dst_stab));
            } else {
                dst_messages.push(msg);
            }
        }

        let copied = ObjectHeader::create(dst.cache(), dst_messages, 1)?;
        map.insert(addr, copied);
        debug!(src = addr, dst = copied, "ohdr.copy");

        for (src_stab, dst_stab) in &stabs {
            stab::post_copy_file(src, src_stab, dst, dst_stab, map, props)?;
        }
        Ok(copied)
    }

    /// Parse a version 1 header at the start of `data`.
    pub fn parse(data: &[u8], sizes: FileSizes) -> Result<ObjectHeader, FormatError> {
        let mut d = Decoder::new(data, sizes);
        let version = d.u8()?;
        if version != OHDR_VERSION {
            return Err(FormatError::InvalidObjectHeaderVersion(version));
        }
        d.skip(1)?;
        let num_messages = d.u16()?;
        let link_count = d.u32()?;
        let chunk_size = d.u32()? as usize;
        d.skip(4)?;
        d.ensure(chunk_size)?;

        let mut messages = Vec::new();
        let end = d.position() + chunk_size;
        for _ in 0..num_messages {
            if d.position() + MESSAGE_HEADER_SIZE > end {
                break;
            }
            let msg_type = d.u16()?;
            let size = d.u16()? as usize;
            let flags = d.u8()?;
            d.skip(3)?;
            if d.position() + size > end {
                return Err(FormatError::Corrupt(format!(
                    "object header message of {size} bytes overruns chunk"
                )));
            }
            let body = d.bytes(size)?;
            if msg_type != MSG_NIL {
                messages.push(HeaderMessage {
                    msg_type,
                    flags,
                    data: body.to_vec(),
                });
            }
        }
        Ok(ObjectHeader {
            link_count,
            messages,
            chunk_size,
        })
    }

    /// Serialize the header, padding the chunk with a NIL message.
    pub fn to_bytes(&self, sizes: FileSizes) -> Result<Vec<u8>, FormatError> {
        let mut body = Encoder::new(sizes);
        let mut count = self.messages.len();
        for m in &self.messages {
            let padded = align8(m.data.len());
            body.u16(m.msg_type);
            body.u16(padded as u16);
            body.u8(m.flags);
            body.zeros(3);
            body.bytes(&m.data);
            body.zeros(padded - m.data.len());
        }
        if body.len() > self.chunk_size {
            return Err(FormatError::Corrupt(format!(
                "object header messages need {} bytes, chunk holds {}",
                body.len(),
                self.chunk_size
            )));
        }
        if body.len() + MESSAGE_HEADER_SIZE <= self.chunk_size {
            let gap = self.chunk_size - body.len() - MESSAGE_HEADER_SIZE;
            body.u16(MSG_NIL);
            body.u16(gap as u16);
            body.zeros(4 + gap);
            count += 1;
        }
        body.pad_to(self.chunk_size);

        let mut e = Encoder::with_capacity(sizes, PREFIX_SIZE + self.chunk_size);
        e.u8(OHDR_VERSION);
        e.u8(0);
        e.u16(count as u16);
        e.u32(self.link_count);
        e.u32(self.chunk_size as u32);
        e.zeros(4);
        e.bytes(&body.into_inner());
        Ok(e.into_inner())
    }
}

impl CacheEntry for ObjectHeader {
    type Context = ();
    const KIND: &'static str = "object header";

    fn load(
        space: &FileSpace,
        addr: Address,
        sizes: FileSizes,
        _ctx: &(),
    ) -> Result<Self, FormatError> {
        let prefix = space.read(addr, PREFIX_SIZE)?;
        let chunk_size = Decoder::new(&prefix[8..12], sizes).u32()? as usize;
        let data = space.read(addr, PREFIX_SIZE + chunk_size)?;
        ObjectHeader::parse(data, sizes)
    }

    fn flush(
        &self,
        space: &mut FileSpace,
        addr: Address,
        sizes: FileSizes,
    ) -> Result<(), FormatError> {
        space.write(addr, &self.to_bytes(sizes)?)
    }

    fn disk_size(&self, _sizes: FileSizes) -> u64 {
        (PREFIX_SIZE + self.chunk_size) as u64
    }
}
