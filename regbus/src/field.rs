//! Hierarchical named bit-field model over one in-memory bit sequence.
//!
//! A [`FieldRegister`] holds a register's bits and a tree of named fields
//! referencing sub-ranges of them. Fields nest, repeat and can permute the
//! bits they reference; ad-hoc views (slices and arbitrary bit selections)
//! can be derived from any field. Bit numbering is LSB-first: bit 0 of a
//! field is its least significant bit, and a field's `offset` names the bit
//! index its most significant bit has within the parent.

use std::collections::HashSet;

use crate::error::{AccessError, ConfigError};
use crate::model::FieldSpec;

/// Default value for a named field, applied by
/// [`FieldRegister::apply_defaults`]
#[derive(Clone, Debug)]
pub enum FieldInit {
    /// Integer, truncated or zero-padded to the field size
    Uint(u64),
    /// Explicit bit sequence, LSB-first, exactly the field size long
    Bits(Vec<bool>),
}

struct FieldNode {
    name: String,
    size: u64,
    /// Local bit index (LSB-first) to index into the register's bit storage
    bit_map: Vec<usize>,
    /// MSB index within the parent field, as declared
    local_offset: u64,
    /// MSB index within the whole register; diagnostics only, addressing is
    /// always parent-relative
    total_offset: u64,
    children: Vec<usize>,
    /// Number of synthetic `#i` repetition children, 0 for plain fields
    repetitions: usize,
}

/// A register as a bit sequence with a tree of named fields.
///
/// Built once from field definitions and then accessed through [`Field`] /
/// [`FieldMut`] handles obtained by dotted path (`"CONF.EN"`, with `#0`,
/// `#1`, ... addressing repetitions). The register content itself is plain
/// driver-side state; moving it to and from hardware is the caller's
/// concern, via [`to_bytes`](FieldRegister::to_bytes) and
/// [`from_bytes`](FieldRegister::from_bytes).
pub struct FieldRegister {
    /// Register bits, index 0 = LSB
    storage: Vec<bool>,
    /// Field arena; node 0 is the unnamed root covering the whole register
    nodes: Vec<FieldNode>,
    /// Validated field defaults, applied on request
    init_values: Vec<(String, FieldInit)>,
}

impl FieldRegister {
    /// Builds a register of `size` bits with the given field tree and
    /// per-field default values, validating the whole structure.
    pub fn new(
        size: u64,
        fields: &[FieldSpec],
        init: &[(String, FieldInit)],
    ) -> Result<Self, ConfigError> {
        if size == 0 {
            return Err(ConfigError::ZeroRegister);
        }

        let root = FieldNode {
            name: String::new(),
            size,
            bit_map: (0..size as usize).collect(),
            local_offset: size - 1,
            total_offset: size - 1,
            children: Vec::new(),
            repetitions: 0,
        };
        let mut nodes = vec![root];
        build_group(&mut nodes, 0, fields)?;

        let reg = Self {
            storage: vec![false; size as usize],
            nodes,
            init_values: Vec::new(),
        };

        let mut init_values = Vec::with_capacity(init.len());
        for (path, value) in init {
            let Some(node) = reg.node_by_path(path) else {
                return Err(ConfigError::UnknownInitField { path: path.clone() });
            };
            if let FieldInit::Bits(bits) = value {
                let expected = reg.nodes[node].size;
                if bits.len() as u64 != expected {
                    return Err(ConfigError::InitBitLengthMismatch {
                        path: path.clone(),
                        expected,
                        actual: bits.len(),
                    });
                }
            }
            init_values.push((path.clone(), value.clone()));
        }

        Ok(Self { init_values, ..reg })
    }

    /// Register size in bits
    #[must_use]
    pub fn size(&self) -> u64 {
        self.nodes[0].size
    }

    /// Read-only handle on the whole register
    #[must_use]
    pub fn root(&self) -> Field<'_> {
        Field::node(self, 0)
    }

    /// Mutable handle on the whole register
    pub fn root_mut(&mut self) -> FieldMut<'_> {
        FieldMut::node(self, 0)
    }

    /// Looks up a field by dotted path; the empty path names the root.
    pub fn field(&self, path: &str) -> Result<Field<'_>, AccessError> {
        let node = self
            .node_by_path(path)
            .ok_or_else(|| AccessError::NoSuchField {
                path: path.to_owned(),
            })?;
        Ok(Field::node(self, node))
    }

    /// Looks up a field by dotted path for modification.
    pub fn field_mut(&mut self, path: &str) -> Result<FieldMut<'_>, AccessError> {
        let node = self
            .node_by_path(path)
            .ok_or_else(|| AccessError::NoSuchField {
                path: path.to_owned(),
            })?;
        Ok(FieldMut::node(self, node))
    }

    /// Writes every configured field default, in definition order.
    pub fn apply_defaults(&mut self) {
        let pending = std::mem::take(&mut self.init_values);
        for (path, value) in &pending {
            // Paths were validated at construction
            let mut field = self
                .field_mut(path)
                .unwrap_or_else(|_| unreachable!("init path validated at construction"));
            match value {
                FieldInit::Uint(v) => field.assign(*v),
                FieldInit::Bits(bits) => field
                    .assign_bits(bits)
                    .unwrap_or_else(|_| unreachable!("init length validated at construction")),
            }
        }
        self.init_values = pending;
    }

    /// Register content as whole bytes, big-endian, zero-padded at the most
    /// significant end if the size is not a byte multiple.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let size = self.storage.len();
        let len = (size + 7) / 8;
        let mut bytes = vec![0u8; len];
        for (i, &bit) in self.storage.iter().enumerate() {
            if bit {
                bytes[len - 1 - i / 8] |= 1 << (i % 8);
            }
        }
        bytes
    }

    /// Replaces the register content from whole bytes as produced by
    /// [`to_bytes`](FieldRegister::to_bytes). Padding bits beyond the
    /// register size are ignored.
    pub fn from_bytes(&mut self, bytes: &[u8]) -> Result<(), AccessError> {
        let size = self.storage.len();
        let len = (size + 7) / 8;
        if bytes.len() != len {
            return Err(AccessError::WrongBitLength {
                expected: size as u64,
                actual: bytes.len() * 8,
            });
        }
        for i in 0..size {
            self.storage[i] = (bytes[len - 1 - i / 8] >> (i % 8)) & 1 == 1;
        }
        Ok(())
    }

    fn node_by_path(&self, path: &str) -> Option<usize> {
        if path.is_empty() {
            return Some(0);
        }
        let mut current = 0;
        for part in path.split('.') {
            current = self.nodes[current]
                .children
                .iter()
                .copied()
                .find(|&child| self.nodes[child].name == part)?;
        }
        Some(current)
    }
}

/// Validates and inserts one group of sibling fields under `parent`.
fn build_group(
    nodes: &mut Vec<FieldNode>,
    parent: usize,
    specs: &[FieldSpec],
) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for spec in specs {
        if spec.name.is_empty() || spec.name.contains('.') || spec.name.starts_with('#') {
            return Err(ConfigError::InvalidFieldName(spec.name.clone()));
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(ConfigError::DuplicateFieldName(spec.name.clone()));
        }
        let child = build_field(nodes, parent, spec)?;
        nodes[parent].children.push(child);
    }
    Ok(())
}

/// Inserts one field (and its subtree) under `parent`, expanding a repeated
/// field into an intermediate node with `#i` repetition children.
fn build_field(
    nodes: &mut Vec<FieldNode>,
    parent: usize,
    spec: &FieldSpec,
) -> Result<usize, ConfigError> {
    if spec.size == 0 {
        return Err(ConfigError::ZeroFieldSize(spec.name.clone()));
    }
    let repeat = match spec.repeat {
        Some(0) => return Err(ConfigError::ZeroRepeat(spec.name.clone())),
        Some(n) => n,
        None => 1,
    };

    if repeat == 1 {
        let node = add_node(
            nodes,
            parent,
            &spec.name,
            spec.size,
            spec.offset,
            spec.bit_order.as_deref(),
        )?;
        build_group(nodes, node, &spec.fields)?;
        return Ok(node);
    }

    let total = spec
        .size
        .checked_mul(repeat)
        .ok_or_else(|| ConfigError::FieldExceedsParent(spec.name.clone()))?;
    // The intermediate node spans all repetitions; any bit order applies to
    // each repetition independently.
    let node = add_node(nodes, parent, &spec.name, total, spec.offset, None)?;
    for i in 0..repeat {
        // Repetition #0 sits at the highest offset
        let rep_offset = total - 1 - i * spec.size;
        let rep = add_node(
            nodes,
            node,
            &format!("#{i}"),
            spec.size,
            rep_offset,
            spec.bit_order.as_deref(),
        )?;
        build_group(nodes, rep, &spec.fields)?;
        nodes[node].children.push(rep);
    }
    nodes[node].repetitions = repeat as usize;
    Ok(node)
}

/// Resolves one field's bit references against its parent and appends the
/// node. `offset` is the parent-local index of the field's MSB; `bit_order`,
/// if given, permutes the referenced bits (listed MSB-first).
fn add_node(
    nodes: &mut Vec<FieldNode>,
    parent: usize,
    name: &str,
    size: u64,
    offset: u64,
    bit_order: Option<&[u64]>,
) -> Result<usize, ConfigError> {
    // Checking the offset bound first keeps `offset + 1` from overflowing
    let parent_size = nodes[parent].size;
    if offset >= parent_size || size > offset + 1 {
        return Err(ConfigError::FieldExceedsParent(name.to_owned()));
    }

    if let Some(order) = bit_order {
        if order.len() as u64 != size {
            return Err(ConfigError::InvalidBitOrder {
                name: name.to_owned(),
                reason: format!("sequence length {} does not match field size {size}", order.len()),
            });
        }
        let mut seen = HashSet::new();
        for &idx in order {
            if idx >= size {
                return Err(ConfigError::InvalidBitOrder {
                    name: name.to_owned(),
                    reason: format!("index {idx} exceeds field size {size}"),
                });
            }
            if !seen.insert(idx) {
                return Err(ConfigError::InvalidBitOrder {
                    name: name.to_owned(),
                    reason: format!("duplicate index {idx}"),
                });
            }
        }
    }

    let base = offset + 1 - size;
    let bit_map = (0..size)
        .map(|k| {
            let local = match bit_order {
                // order[0] names the parent bit for the field's MSB
                Some(order) => base + order[(size - 1 - k) as usize],
                None => base + k,
            };
            nodes[parent].bit_map[local as usize]
        })
        .collect();

    nodes.push(FieldNode {
        name: name.to_owned(),
        size,
        bit_map,
        local_offset: offset,
        // The parent's total_offset is at least parent_size - 1, so this
        // cannot underflow
        total_offset: nodes[parent].total_offset + 1 + offset - parent_size,
        children: Vec::new(),
        repetitions: 0,
    });
    Ok(nodes.len() - 1)
}

/// Resolves the bit references for a derived view or sub-field lookup,
/// shared by [`Field`] and [`FieldMut`].
struct ViewPlan {
    bits: Vec<usize>,
    node: Option<usize>,
}

fn plan_child(reg: &FieldRegister, node: Option<usize>, name: &str) -> Result<ViewPlan, AccessError> {
    let missing = || AccessError::NoSuchField {
        path: name.to_owned(),
    };
    let node = node.ok_or_else(missing)?;
    let child = reg.nodes[node]
        .children
        .iter()
        .copied()
        .find(|&child| reg.nodes[child].name == name)
        .ok_or_else(missing)?;
    Ok(ViewPlan {
        bits: reg.nodes[child].bit_map.clone(),
        node: Some(child),
    })
}

fn plan_repetition(
    reg: &FieldRegister,
    node: Option<usize>,
    index: usize,
) -> Result<ViewPlan, AccessError> {
    let count = node.map_or(0, |node| reg.nodes[node].repetitions);
    if count == 0 {
        return Err(AccessError::NoRepetitions {
            path: node.map_or(String::new(), |node| reg.nodes[node].name.clone()),
        });
    }
    if index >= count {
        return Err(AccessError::RepetitionOutOfRange {
            path: reg.nodes[node.unwrap_or_default()].name.clone(),
            index,
            count,
        });
    }
    plan_child(reg, node, &format!("#{index}"))
}

fn plan_slice(bits: &[usize], msb: usize, lsb: usize) -> Result<ViewPlan, AccessError> {
    if msb < lsb {
        return Err(AccessError::InvalidSlice { msb, lsb });
    }
    if msb >= bits.len() {
        return Err(AccessError::BitIndexOutOfRange {
            index: msb,
            size: bits.len() as u64,
        });
    }
    Ok(ViewPlan {
        bits: bits[lsb..=msb].to_vec(),
        node: None,
    })
}

fn plan_select(bits: &[usize], indices: &[usize]) -> Result<ViewPlan, AccessError> {
    if indices.is_empty() {
        return Err(AccessError::EmptySelection);
    }
    let mut seen = HashSet::new();
    for &idx in indices {
        if idx >= bits.len() {
            return Err(AccessError::BitIndexOutOfRange {
                index: idx,
                size: bits.len() as u64,
            });
        }
        if !seen.insert(idx) {
            return Err(AccessError::DuplicateSelectionIndex(idx));
        }
    }
    // The first listed index becomes the view's MSB
    Ok(ViewPlan {
        bits: indices.iter().rev().map(|&idx| bits[idx]).collect(),
        node: None,
    })
}

/// Read-only handle on a field, a repetition, or a derived bit view
#[derive(Clone)]
pub struct Field<'a> {
    reg: &'a FieldRegister,
    /// Storage index per local bit, LSB-first
    bits: Vec<usize>,
    /// Arena node for named fields; `None` for derived views
    node: Option<usize>,
}

impl<'a> Field<'a> {
    fn node(reg: &'a FieldRegister, node: usize) -> Self {
        Self {
            reg,
            bits: reg.nodes[node].bit_map.clone(),
            node: Some(node),
        }
    }

    fn view(reg: &'a FieldRegister, plan: ViewPlan) -> Self {
        Self {
            reg,
            bits: plan.bits,
            node: plan.node,
        }
    }

    /// Field size in bits
    #[must_use]
    pub fn size(&self) -> u64 {
        self.bits.len() as u64
    }

    /// Number of `#i` repetitions, 0 for plain fields and views
    #[must_use]
    pub fn repetitions(&self) -> usize {
        self.node.map_or(0, |node| self.reg.nodes[node].repetitions)
    }

    /// MSB index within the parent field, as declared; `None` for derived
    /// views
    #[must_use]
    pub fn offset(&self) -> Option<u64> {
        self.node.map(|node| self.reg.nodes[node].local_offset)
    }

    /// MSB index within the whole register, for diagnostics; `None` for
    /// derived views
    #[must_use]
    pub fn total_offset(&self) -> Option<u64> {
        self.node.map(|node| self.reg.nodes[node].total_offset)
    }

    /// State of the bit at local index `idx` (LSB-first)
    pub fn bit(&self, idx: usize) -> Result<bool, AccessError> {
        Ok(self.reg.storage[self.storage_index(idx)?])
    }

    /// Handle bound to the bit at local index `idx` (LSB-first)
    pub fn bit_ref(&self, idx: usize) -> Result<BitRef<'a>, AccessError> {
        Ok(BitRef {
            reg: self.reg,
            idx: self.storage_index(idx)?,
        })
    }

    fn storage_index(&self, idx: usize) -> Result<usize, AccessError> {
        self.bits
            .get(idx)
            .copied()
            .ok_or(AccessError::BitIndexOutOfRange {
                index: idx,
                size: self.size(),
            })
    }

    /// Field content as a bit sequence, LSB-first
    #[must_use]
    pub fn bits(&self) -> Vec<bool> {
        self.bits.iter().map(|&idx| self.reg.storage[idx]).collect()
    }

    /// Field content interpreted as an unsigned integer
    pub fn value(&self) -> Result<u64, AccessError> {
        if self.size() > 64 {
            return Err(AccessError::FieldTooWide { size: self.size() });
        }
        let mut value = 0u64;
        for (k, &idx) in self.bits.iter().enumerate() {
            if self.reg.storage[idx] {
                value |= 1 << k;
            }
        }
        Ok(value)
    }

    /// Named sub-field
    pub fn child(&self, name: &str) -> Result<Field<'a>, AccessError> {
        plan_child(self.reg, self.node, name).map(|plan| Field::view(self.reg, plan))
    }

    /// The `index`-th repetition of a repeated field
    pub fn n(&self, index: usize) -> Result<Field<'a>, AccessError> {
        plan_repetition(self.reg, self.node, index).map(|plan| Field::view(self.reg, plan))
    }

    /// Contiguous view of the local bits `msb..=lsb`
    pub fn slice(&self, msb: usize, lsb: usize) -> Result<Field<'a>, AccessError> {
        plan_slice(&self.bits, msb, lsb).map(|plan| Field::view(self.reg, plan))
    }

    /// View of arbitrary local bits; the first listed index becomes the
    /// view's MSB
    pub fn select(&self, indices: &[usize]) -> Result<Field<'a>, AccessError> {
        plan_select(&self.bits, indices).map(|plan| Field::view(self.reg, plan))
    }
}

/// Mutable handle on a field, a repetition, or a derived bit view.
///
/// Navigation methods consume the handle; obtain a fresh one from the
/// [`FieldRegister`] to modify several fields in sequence.
pub struct FieldMut<'a> {
    reg: &'a mut FieldRegister,
    bits: Vec<usize>,
    node: Option<usize>,
}

impl<'a> FieldMut<'a> {
    fn node(reg: &'a mut FieldRegister, node: usize) -> Self {
        let bits = reg.nodes[node].bit_map.clone();
        Self {
            reg,
            bits,
            node: Some(node),
        }
    }

    /// Field size in bits
    #[must_use]
    pub fn size(&self) -> u64 {
        self.bits.len() as u64
    }

    /// Number of `#i` repetitions, 0 for plain fields and views
    #[must_use]
    pub fn repetitions(&self) -> usize {
        self.node.map_or(0, |node| self.reg.nodes[node].repetitions)
    }

    /// MSB index within the parent field, as declared; `None` for derived
    /// views
    #[must_use]
    pub fn offset(&self) -> Option<u64> {
        self.node.map(|node| self.reg.nodes[node].local_offset)
    }

    /// MSB index within the whole register, for diagnostics; `None` for
    /// derived views
    #[must_use]
    pub fn total_offset(&self) -> Option<u64> {
        self.node.map(|node| self.reg.nodes[node].total_offset)
    }

    /// Field content interpreted as an unsigned integer
    pub fn value(&self) -> Result<u64, AccessError> {
        self.as_field().value()
    }

    /// Field content as a bit sequence, LSB-first
    #[must_use]
    pub fn bits(&self) -> Vec<bool> {
        self.as_field().bits()
    }

    /// Assigns an integer, truncated or zero-padded to the field size at
    /// the most significant end.
    pub fn assign(&mut self, value: u64) {
        for (k, &idx) in self.bits.iter().enumerate() {
            self.reg.storage[idx] = k < 64 && (value >> k) & 1 == 1;
        }
    }

    /// Assigns a bit sequence (LSB-first), which must match the field size
    /// exactly.
    pub fn assign_bits(&mut self, bits: &[bool]) -> Result<(), AccessError> {
        if bits.len() != self.bits.len() {
            return Err(AccessError::WrongBitLength {
                expected: self.size(),
                actual: bits.len(),
            });
        }
        for (&idx, &bit) in self.bits.iter().zip(bits) {
            self.reg.storage[idx] = bit;
        }
        Ok(())
    }

    /// Sets or clears every bit of the field.
    pub fn set_all(&mut self, value: bool) {
        for &idx in &self.bits {
            self.reg.storage[idx] = value;
        }
    }

    /// Sets the bit at local index `idx` (LSB-first).
    pub fn set_bit(&mut self, idx: usize, value: bool) -> Result<(), AccessError> {
        let storage_idx = *self.bits.get(idx).ok_or(AccessError::BitIndexOutOfRange {
            index: idx,
            size: self.size(),
        })?;
        self.reg.storage[storage_idx] = value;
        Ok(())
    }

    /// Mutable handle bound to the bit at local index `idx` (LSB-first)
    pub fn bit_mut(self, idx: usize) -> Result<BitMut<'a>, AccessError> {
        let storage_idx = *self.bits.get(idx).ok_or(AccessError::BitIndexOutOfRange {
            index: idx,
            size: self.size(),
        })?;
        Ok(BitMut {
            reg: self.reg,
            idx: storage_idx,
        })
    }

    /// Named sub-field
    pub fn child(self, name: &str) -> Result<FieldMut<'a>, AccessError> {
        let plan = plan_child(self.reg, self.node, name)?;
        Ok(FieldMut {
            reg: self.reg,
            bits: plan.bits,
            node: plan.node,
        })
    }

    /// The `index`-th repetition of a repeated field
    pub fn n(self, index: usize) -> Result<FieldMut<'a>, AccessError> {
        let plan = plan_repetition(self.reg, self.node, index)?;
        Ok(FieldMut {
            reg: self.reg,
            bits: plan.bits,
            node: plan.node,
        })
    }

    /// Contiguous view of the local bits `msb..=lsb`
    pub fn slice(self, msb: usize, lsb: usize) -> Result<FieldMut<'a>, AccessError> {
        let plan = plan_slice(&self.bits, msb, lsb)?;
        Ok(FieldMut {
            reg: self.reg,
            bits: plan.bits,
            node: plan.node,
        })
    }

    /// View of arbitrary local bits; the first listed index becomes the
    /// view's MSB
    pub fn select(self, indices: &[usize]) -> Result<FieldMut<'a>, AccessError> {
        let plan = plan_select(&self.bits, indices)?;
        Ok(FieldMut {
            reg: self.reg,
            bits: plan.bits,
            node: plan.node,
        })
    }

    fn as_field(&self) -> Field<'_> {
        Field {
            reg: self.reg,
            bits: self.bits.clone(),
            node: self.node,
        }
    }
}

/// Read-only handle on a single register bit
#[derive(Clone, Copy)]
pub struct BitRef<'a> {
    reg: &'a FieldRegister,
    idx: usize,
}

impl BitRef<'_> {
    #[must_use]
    pub fn get(&self) -> bool {
        self.reg.storage[self.idx]
    }
}

/// Mutable handle on a single register bit
pub struct BitMut<'a> {
    reg: &'a mut FieldRegister,
    idx: usize,
}

impl BitMut<'_> {
    #[must_use]
    pub fn get(&self) -> bool {
        self.reg.storage[self.idx]
    }

    pub fn set(&mut self, value: bool) {
        self.reg.storage[self.idx] = value;
    }
}
