//! Just enough of a BTF reader to find `task_struct` field offsets.
//!
//! aya programs carry no CO-RE relocations, so the offsets the hooks need
//! are looked up here once and handed over through the `TASK_LAYOUT` global.

use std::{collections::HashMap, fs, path::Path};

use anyhow::{anyhow, bail, Context, Result};
use oncpu_common::TaskLayout;

pub const VMLINUX_BTF: &str = "/sys/kernel/btf/vmlinux";

const MAGIC: u16 = 0xeb9f;
const HEADER_LEN: usize = 24;
const TYPE_LEN: usize = 12;
const MAX_NESTING: usize = 8;

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

#[derive(Debug, Clone, Copy)]
struct BtfType {
    name_off: u32,
    kind: u32,
    vlen: usize,
    kind_flag: bool,
    size_or_type: u32,
    // start of the kind-specific data following the common header
    extra: usize,
}

pub struct Btf {
    data: Vec<u8>,
    strings: usize,
    strings_end: usize,
    // indexed by type id, id 0 is void
    types: Vec<BtfType>,
}

impl Btf {
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        Self::parse(data)
    }

    pub fn parse(data: Vec<u8>) -> Result<Self> {
        if read_u16(&data, 0)? != MAGIC {
            bail!("not a BTF blob (bad magic)");
        }
        let hdr_len = read_u32(&data, 4)? as usize;
        if hdr_len < HEADER_LEN {
            bail!("BTF header too short: {hdr_len}");
        }
        let type_off = read_u32(&data, 8)? as usize;
        let type_len = read_u32(&data, 12)? as usize;
        let str_off = read_u32(&data, 16)? as usize;
        let str_len = read_u32(&data, 20)? as usize;

        let types_start = hdr_len + type_off;
        let types_end = types_start + type_len;
        let strings = hdr_len + str_off;
        let strings_end = strings + str_len;
        if types_end > data.len() || strings_end > data.len() {
            bail!("BTF sections run past the end of the blob");
        }

        let mut types = vec![BtfType {
            name_off: 0,
            kind: 0,
            vlen: 0,
            kind_flag: false,
            size_or_type: 0,
            extra: 0,
        }];
        let mut pos = types_start;
        while pos < types_end {
            let name_off = read_u32(&data, pos)?;
            let info = read_u32(&data, pos + 4)?;
            let size_or_type = read_u32(&data, pos + 8)?;
            let kind = (info >> 24) & 0x1f;
            let vlen = (info & 0xffff) as usize;
            let trailing = match kind {
                KIND_INT | KIND_VAR | KIND_DECL_TAG => 4,
                KIND_ARRAY => 12,
                KIND_STRUCT | KIND_UNION | KIND_DATASEC | KIND_ENUM64 => 12 * vlen,
                KIND_ENUM | KIND_FUNC_PROTO => 8 * vlen,
                KIND_PTR | KIND_FWD | KIND_TYPEDEF | KIND_VOLATILE | KIND_CONST | KIND_RESTRICT
                | KIND_FUNC | KIND_FLOAT | KIND_TYPE_TAG => 0,
                other => bail!("unknown BTF kind {other} for type {}", types.len()),
            };
            types.push(BtfType {
                name_off,
                kind,
                vlen,
                kind_flag: info >> 31 == 1,
                size_or_type,
                extra: pos + TYPE_LEN,
            });
            pos += TYPE_LEN + trailing;
        }
        if pos != types_end {
            bail!("BTF type section truncated");
        }

        Ok(Self {
            data,
            strings,
            strings_end,
            types,
        })
    }

    fn name(&self, off: u32) -> &str {
        let start = self.strings + off as usize;
        if start >= self.strings_end {
            return "";
        }
        let bytes = &self.data[start..self.strings_end];
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        std::str::from_utf8(&bytes[..len]).unwrap_or("")
    }

    /// Byte offset of every named member of `struct <name>`, looking
    /// through anonymous nested structs and unions.
    pub fn struct_offsets(&self, name: &str) -> Result<HashMap<String, u32>> {
        let id = self
            .types
            .iter()
            .position(|t| t.kind == KIND_STRUCT && t.vlen > 0 && self.name(t.name_off) == name)
            .ok_or_else(|| anyhow!("struct {name} not found in BTF"))?;
        let mut out = HashMap::new();
        self.collect_members(id, 0, 0, &mut out)?;
        Ok(out)
    }

    fn collect_members(
        &self,
        id: usize,
        base_bits: u32,
        depth: usize,
        out: &mut HashMap<String, u32>,
    ) -> Result<()> {
        if depth > MAX_NESTING {
            bail!("anonymous members nested too deep");
        }
        let ty = self.types[id];
        for i in 0..ty.vlen {
            let at = ty.extra + i * 12;
            let name_off = read_u32(&self.data, at)?;
            let member_type = read_u32(&self.data, at + 4)?;
            let raw_offset = read_u32(&self.data, at + 8)?;
            // with kind_flag the top byte holds the bitfield size
            let bits = base_bits
                + if ty.kind_flag {
                    raw_offset & 0x00ff_ffff
                } else {
                    raw_offset
                };

            let member = self.name(name_off);
            if member.is_empty() {
                if let Some(inner) = self.resolve(member_type) {
                    if matches!(self.types[inner].kind, KIND_STRUCT | KIND_UNION) {
                        self.collect_members(inner, bits, depth + 1, out)?;
                    }
                }
            } else {
                out.entry(member.to_string()).or_insert(bits / 8);
            }
        }
        Ok(())
    }

    // skip typedefs and qualifiers
    fn resolve(&self, mut id: u32) -> Option<usize> {
        for _ in 0..MAX_NESTING * 4 {
            let ty = self.types.get(id as usize)?;
            match ty.kind {
                KIND_TYPEDEF | KIND_VOLATILE | KIND_CONST | KIND_RESTRICT | KIND_TYPE_TAG => {
                    id = ty.size_or_type
                }
                _ => return Some(id as usize),
            }
        }
        None
    }
}

pub fn task_layout(btf: &Btf) -> Result<TaskLayout> {
    let fields = btf.struct_offsets("task_struct")?;
    let field = |name: &str| {
        fields
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("task_struct has no member {name}"))
    };
    Ok(TaskLayout {
        pid: field("pid")?,
        tgid: field("tgid")?,
        real_parent: field("real_parent")?,
        exit_code: field("exit_code")?,
    })
}

pub fn load_task_layout(path: &Path) -> Result<TaskLayout> {
    task_layout(&Btf::from_file(path)?)
}

fn read_u16(data: &[u8], at: usize) -> Result<u16> {
    data.get(at..at + 2)
        .and_then(|b| b.try_into().ok())
        .map(u16::from_ne_bytes)
        .ok_or_else(|| anyhow!("BTF truncated at offset {at}"))
}

fn read_u32(data: &[u8], at: usize) -> Result<u32> {
    data.get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_ne_bytes)
        .ok_or_else(|| anyhow!("BTF truncated at offset {at}"))
}
