//! Just enough of the kernel's BTF to place `struct sk_buff` members and name
//! `enum skb_drop_reason` values on the running kernel.

use std::{fs, path::Path};

use crate::{
    config::SkbOffsets,
    error::{Error, Result},
    reasons::DropReasons,
};

const MAGIC: u16 = 0xeb9f;
const HEADER_LEN: usize = 24;
const MAX_ANON_DEPTH: usize = 8;

const KIND_INT: u32 = 1;
const KIND_PTR: u32 = 2;
const KIND_ARRAY: u32 = 3;
const KIND_STRUCT: u32 = 4;
const KIND_UNION: u32 = 5;
const KIND_ENUM: u32 = 6;
const KIND_FWD: u32 = 7;
const KIND_TYPEDEF: u32 = 8;
const KIND_VOLATILE: u32 = 9;
const KIND_CONST: u32 = 10;
const KIND_RESTRICT: u32 = 11;
const KIND_FUNC: u32 = 12;
const KIND_FUNC_PROTO: u32 = 13;
const KIND_VAR: u32 = 14;
const KIND_DATASEC: u32 = 15;
const KIND_FLOAT: u32 = 16;
const KIND_DECL_TAG: u32 = 17;
const KIND_TYPE_TAG: u32 = 18;
const KIND_ENUM64: u32 = 19;

#[derive(Debug)]
struct Member {
    name_off: u32,
    type_id: u32,
    bit_offset: u32,
    bit_size: u32,
}

#[derive(Debug)]
enum Kind {
    /// Struct or union.
    Composite(Vec<Member>),
    Enum(Vec<(u32, u64)>),
    Other,
}

#[derive(Debug)]
struct Type {
    name_off: u32,
    kind: Kind,
}

/// Parsed type and string sections. Type ids index `types` directly; id 0
/// is `void`.
#[derive(Debug)]
pub struct Btf {
    types: Vec<Type>,
    strings: Vec<u8>,
}

pub fn read(path: &Path) -> Result<Btf> {
    parse(&fs::read(path)?)
}

pub fn parse(data: &[u8]) -> Result<Btf> {
    let big_endian = match data.get(..2) {
        Some(m) if u16::from_le_bytes([m[0], m[1]]) == MAGIC => false,
        Some(m) if u16::from_be_bytes([m[0], m[1]]) == MAGIC => true,
        _ => return Err(Error::Btf("bad magic".to_string())),
    };
    let mut header = Reader::new(data, big_endian);
    header.skip(4)?;
    let hdr_len = header.u32()? as usize;
    let type_off = header.u32()? as usize;
    let type_len = header.u32()? as usize;
    let str_off = header.u32()? as usize;
    let str_len = header.u32()? as usize;
    if hdr_len < HEADER_LEN {
        return Err(Error::Btf(format!("header length {hdr_len}")));
    }

    let section = |off: usize, len: usize| {
        let start = hdr_len.checked_add(off);
        let end = start.and_then(|s| s.checked_add(len));
        start
            .zip(end)
            .and_then(|(s, e)| data.get(s..e))
            .ok_or_else(|| Error::Btf("section out of bounds".to_string()))
    };
    let type_section = section(type_off, type_len)?;
    let strings = section(str_off, str_len)?.to_vec();

    let mut types = vec![Type {
        name_off: 0,
        kind: Kind::Other,
    }];
    let mut r = Reader::new(type_section, big_endian);
    while !r.is_empty() {
        types.push(parse_type(&mut r)?);
    }
    Ok(Btf { types, strings })
}

fn parse_type(r: &mut Reader<'_>) -> Result<Type> {
    let name_off = r.u32()?;
    let info = r.u32()?;
    let _size_or_type = r.u32()?;
    let kind_flag = info >> 31 == 1;
    let vlen = (info & 0xffff) as usize;

    let kind = match (info >> 24) & 0x1f {
        KIND_STRUCT | KIND_UNION => {
            let mut members = Vec::with_capacity(vlen);
            for _ in 0..vlen {
                let name_off = r.u32()?;
                let type_id = r.u32()?;
                let offset = r.u32()?;
                let (bit_offset, bit_size) = if kind_flag {
                    (offset & 0x00ff_ffff, offset >> 24)
                } else {
                    (offset, 0)
                };
                members.push(Member {
                    name_off,
                    type_id,
                    bit_offset,
                    bit_size,
                });
            }
            Kind::Composite(members)
        }
        KIND_ENUM => {
            let mut values = Vec::with_capacity(vlen);
            for _ in 0..vlen {
                let name_off = r.u32()?;
                values.push((name_off, r.u32()? as u64));
            }
            Kind::Enum(values)
        }
        KIND_ENUM64 => {
            let mut values = Vec::with_capacity(vlen);
            for _ in 0..vlen {
                let name_off = r.u32()?;
                let lo = r.u32()? as u64;
                let hi = r.u32()? as u64;
                values.push((name_off, hi << 32 | lo));
            }
            Kind::Enum(values)
        }
        KIND_INT | KIND_VAR | KIND_DECL_TAG => {
            r.skip(4)?;
            Kind::Other
        }
        KIND_ARRAY => {
            r.skip(12)?;
            Kind::Other
        }
        KIND_FUNC_PROTO => {
            r.skip(vlen * 8)?;
            Kind::Other
        }
        KIND_DATASEC => {
            r.skip(vlen * 12)?;
            Kind::Other
        }
        KIND_PTR | KIND_FWD | KIND_TYPEDEF | KIND_VOLATILE | KIND_CONST | KIND_RESTRICT
        | KIND_FUNC | KIND_FLOAT | KIND_TYPE_TAG => Kind::Other,
        other => return Err(Error::Btf(format!("unknown type kind {other}"))),
    };
    Ok(Type { name_off, kind })
}

impl Btf {
    fn name(&self, off: u32) -> &str {
        let tail = self.strings.get(off as usize..).unwrap_or_default();
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        std::str::from_utf8(&tail[..end]).unwrap_or_default()
    }

    fn composite(&self, name: &str) -> Option<&[Member]> {
        self.types.iter().find_map(|ty| match &ty.kind {
            Kind::Composite(members) if self.name(ty.name_off) == name => Some(members.as_slice()),
            _ => None,
        })
    }

    /// Byte offset of `member` in `struct name`, looking through anonymous
    /// structs and unions. Bitfields have no byte offset.
    pub fn member_offset(&self, name: &str, member: &str) -> Option<u32> {
        let bits = self.find_member(self.composite(name)?, member, 0, 0)?;
        (bits % 8 == 0).then_some(bits / 8)
    }

    fn find_member(&self, members: &[Member], target: &str, base: u32, depth: usize) -> Option<u32> {
        if depth > MAX_ANON_DEPTH {
            return None;
        }
        for m in members {
            let name = self.name(m.name_off);
            if name == target {
                return (m.bit_size == 0).then_some(base + m.bit_offset);
            }
            if name.is_empty() {
                let nested = self.types.get(m.type_id as usize).and_then(|ty| match &ty.kind {
                    Kind::Composite(nested) => Some(nested),
                    _ => None,
                });
                if let Some(found) = nested
                    .and_then(|nested| self.find_member(nested, target, base + m.bit_offset, depth + 1))
                {
                    return Some(found);
                }
            }
        }
        None
    }

    /// The `sk_buff` members the drop observer reads. Members the kernel
    /// does not describe are left unset.
    pub fn skb_offsets(&self) -> SkbOffsets {
        let at = |member| self.member_offset("sk_buff", member);
        SkbOffsets {
            len: at("len"),
            iif: at("skb_iif"),
            head: at("head"),
            network: at("network_header"),
            transport: at("transport_header"),
        }
    }

    pub fn drop_reasons(&self) -> Option<DropReasons> {
        self.types.iter().find_map(|ty| match &ty.kind {
            Kind::Enum(values) if self.name(ty.name_off) == "skb_drop_reason" => Some(
                values
                    .iter()
                    .map(|&(name_off, value)| (value as u32, self.name(name_off).to_string()))
                    .collect(),
            ),
            _ => None,
        })
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    big_endian: bool,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], big_endian: bool) -> Self {
        Reader {
            data,
            pos: 0,
            big_endian,
        }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let bytes = self
            .pos
            .checked_add(n)
            .and_then(|end| self.data.get(self.pos..end))
            .ok_or_else(|| Error::Btf("truncated type section".to_string()))?;
        self.pos += n;
        Ok(bytes)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        let word = [b[0], b[1], b[2], b[3]];
        Ok(if self.big_endian {
            u32::from_be_bytes(word)
        } else {
            u32::from_le_bytes(word)
        })
    }
}
