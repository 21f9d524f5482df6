// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Readable names for table-driven test cases.
//!
//! See [`crate::case_name!`] for the usual entry point.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::ser::{self, Serialize};
use thiserror::Error;

/// Longest name produced; longer names are cut and end in `...`.
pub const MAX_CASE_NAME_LEN: usize = 64;

const ELLIPSIS: &str = "...";

/// One flattened case part.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CasePart {
    text: String,
    index: Option<i128>,
    zero: bool,
}

impl CasePart {
    fn empty() -> Self {
        Self::scalar(String::new(), true)
    }

    fn scalar(text: String, zero: bool) -> Self {
        Self {
            zero: zero || text.is_empty(),
            text,
            index: None,
        }
    }

    fn integer(value: i128) -> Self {
        Self {
            text: value.to_string(),
            index: Some(value),
            zero: value == 0,
        }
    }

    fn joined(parts: impl IntoIterator<Item = CasePart>) -> Self {
        let text = parts
            .into_iter()
            .filter(|part| !part.text.is_empty())
            .map(|part| part.text)
            .collect::<Vec<_>>()
            .join(" ");
        Self::scalar(text, false)
    }

    /// The part as it appears in a name when it is not the leading index.
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

/// Flatten one case part for [`format_case_name`]. Parts that fail to
/// serialize contribute nothing.
pub fn to_part<T: Serialize + ?Sized>(part: &T) -> CasePart {
    part.serialize(Flattener).unwrap_or_else(|_| CasePart::empty())
}

/// Join case parts into a single name.
///
/// A leading integer is zero-padded to two digits so cases sort in order.
/// Sequences flatten to their elements, maps to their values in key order and
/// structs to their non-zero fields in declaration order. `None` and unit
/// contribute nothing. Runs of underscores and whitespace collapse to a single
/// space and `/` becomes `%`, so the name reads well in libtest output and
/// file names.
pub fn format_case_name(parts: &[CasePart]) -> String {
    let mut words = Vec::with_capacity(parts.len());
    for (i, part) in parts.iter().enumerate() {
        match part.index {
            Some(index) if i == 0 => words.push(format!("{index:02}")),
            _ => words.push(part.text.clone()),
        }
    }

    let joined = words.join(" ");
    let name = separator_pattern()
        .replace_all(joined.trim(), " ")
        .replace('/', "%");
    truncate(name)
}

fn truncate(name: String) -> String {
    if name.chars().count() <= MAX_CASE_NAME_LEN {
        return name;
    }
    let keep = MAX_CASE_NAME_LEN - ELLIPSIS.len();
    let mut cut: String = name.chars().take(keep).collect();
    cut.push_str(ELLIPSIS);
    cut
}

fn separator_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[_\s]+").expect("separator pattern is valid"))
}

#[derive(Debug, Error)]
#[error("{0}")]
struct FlattenError(String);

impl ser::Error for FlattenError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        FlattenError(msg.to_string())
    }
}

/// Serializer that renders a value straight into a [`CasePart`].
struct Flattener;

impl ser::Serializer for Flattener {
    type Ok = CasePart;
    type Error = FlattenError;
    type SerializeSeq = SeqFlattener;
    type SerializeTuple = SeqFlattener;
    type SerializeTupleStruct = SeqFlattener;
    type SerializeTupleVariant = SeqFlattener;
    type SerializeMap = MapFlattener;
    type SerializeStruct = StructFlattener;
    type SerializeStructVariant = StructFlattener;

    fn serialize_bool(self, v: bool) -> Result<CasePart, FlattenError> {
        Ok(CasePart::scalar(v.to_string(), !v))
    }

    fn serialize_i8(self, v: i8) -> Result<CasePart, FlattenError> {
        Ok(CasePart::integer(v.into()))
    }

    fn serialize_i16(self, v: i16) -> Result<CasePart, FlattenError> {
        Ok(CasePart::integer(v.into()))
    }

    fn serialize_i32(self, v: i32) -> Result<CasePart, FlattenError> {
        Ok(CasePart::integer(v.into()))
    }

    fn serialize_i64(self, v: i64) -> Result<CasePart, FlattenError> {
        Ok(CasePart::integer(v.into()))
    }

    fn serialize_i128(self, v: i128) -> Result<CasePart, FlattenError> {
        Ok(CasePart::integer(v))
    }

    fn serialize_u8(self, v: u8) -> Result<CasePart, FlattenError> {
        Ok(CasePart::integer(v.into()))
    }

    fn serialize_u16(self, v: u16) -> Result<CasePart, FlattenError> {
        Ok(CasePart::integer(v.into()))
    }

    fn serialize_u32(self, v: u32) -> Result<CasePart, FlattenError> {
        Ok(CasePart::integer(v.into()))
    }

    fn serialize_u64(self, v: u64) -> Result<CasePart, FlattenError> {
        Ok(CasePart::integer(v.into()))
    }

    fn serialize_u128(self, v: u128) -> Result<CasePart, FlattenError> {
        Ok(match i128::try_from(v) {
            Ok(v) => CasePart::integer(v),
            Err(_) => CasePart::scalar(v.to_string(), false),
        })
    }

    fn serialize_f32(self, v: f32) -> Result<CasePart, FlattenError> {
        Ok(CasePart::scalar(v.to_string(), v == 0.0))
    }

    fn serialize_f64(self, v: f64) -> Result<CasePart, FlattenError> {
        Ok(CasePart::scalar(v.to_string(), v == 0.0))
    }

    fn serialize_char(self, v: char) -> Result<CasePart, FlattenError> {
        Ok(CasePart::scalar(v.to_string(), v == '\0'))
    }

    fn serialize_str(self, v: &str) -> Result<CasePart, FlattenError> {
        Ok(CasePart::scalar(v.to_string(), false))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<CasePart, FlattenError> {
        Ok(CasePart::joined(
            v.iter().map(|byte| CasePart::integer((*byte).into())),
        ))
    }

    fn serialize_none(self) -> Result<CasePart, FlattenError> {
        Ok(CasePart::empty())
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<CasePart, FlattenError> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<CasePart, FlattenError> {
        Ok(CasePart::empty())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<CasePart, FlattenError> {
        Ok(CasePart::empty())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<CasePart, FlattenError> {
        Ok(CasePart::scalar(variant.to_string(), false))
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<CasePart, FlattenError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        value: &T,
    ) -> Result<CasePart, FlattenError> {
        value.serialize(self)
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SeqFlattener, FlattenError> {
        Ok(SeqFlattener::with_capacity(len.unwrap_or(0)))
    }

    fn serialize_tuple(self, len: usize) -> Result<SeqFlattener, FlattenError> {
        Ok(SeqFlattener::with_capacity(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<SeqFlattener, FlattenError> {
        Ok(SeqFlattener::with_capacity(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        len: usize,
    ) -> Result<SeqFlattener, FlattenError> {
        Ok(SeqFlattener::with_capacity(len))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<MapFlattener, FlattenError> {
        Ok(MapFlattener::default())
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<StructFlattener, FlattenError> {
        Ok(StructFlattener::with_capacity(len))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        len: usize,
    ) -> Result<StructFlattener, FlattenError> {
        Ok(StructFlattener::with_capacity(len))
    }
}

/// Every element, in order.
struct SeqFlattener {
    parts: Vec<CasePart>,
}

impl SeqFlattener {
    fn with_capacity(len: usize) -> Self {
        Self {
            parts: Vec::with_capacity(len),
        }
    }

    fn push<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), FlattenError> {
        self.parts.push(value.serialize(Flattener)?);
        Ok(())
    }

    fn finish(self) -> Result<CasePart, FlattenError> {
        Ok(CasePart::joined(self.parts))
    }
}

impl ser::SerializeSeq for SeqFlattener {
    type Ok = CasePart;
    type Error = FlattenError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), FlattenError> {
        self.push(value)
    }

    fn end(self) -> Result<CasePart, FlattenError> {
        self.finish()
    }
}

impl ser::SerializeTuple for SeqFlattener {
    type Ok = CasePart;
    type Error = FlattenError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), FlattenError> {
        self.push(value)
    }

    fn end(self) -> Result<CasePart, FlattenError> {
        self.finish()
    }
}

impl ser::SerializeTupleStruct for SeqFlattener {
    type Ok = CasePart;
    type Error = FlattenError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), FlattenError> {
        self.push(value)
    }

    fn end(self) -> Result<CasePart, FlattenError> {
        self.finish()
    }
}

impl ser::SerializeTupleVariant for SeqFlattener {
    type Ok = CasePart;
    type Error = FlattenError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), FlattenError> {
        self.push(value)
    }

    fn end(self) -> Result<CasePart, FlattenError> {
        self.finish()
    }
}

/// Values sorted by the text of their keys.
#[derive(Default)]
struct MapFlattener {
    entries: Vec<(String, CasePart)>,
    key: Option<String>,
}

impl ser::SerializeMap for MapFlattener {
    type Ok = CasePart;
    type Error = FlattenError;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), FlattenError> {
        self.key = Some(key.serialize(Flattener)?.text);
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), FlattenError> {
        let key = self.key.take().unwrap_or_default();
        self.entries.push((key, value.serialize(Flattener)?));
        Ok(())
    }

    fn end(mut self) -> Result<CasePart, FlattenError> {
        self.entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(CasePart::joined(
            self.entries.into_iter().map(|(_, value)| value),
        ))
    }
}

/// Non-zero fields in declaration order.
struct StructFlattener {
    fields: Vec<CasePart>,
}

impl StructFlattener {
    fn with_capacity(len: usize) -> Self {
        Self {
            fields: Vec::with_capacity(len),
        }
    }

    fn push<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), FlattenError> {
        let field = value.serialize(Flattener)?;
        if !field.zero {
            self.fields.push(field);
        }
        Ok(())
    }
}

impl ser::SerializeStruct for StructFlattener {
    type Ok = CasePart;
    type Error = FlattenError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> Result<(), FlattenError> {
        self.push(value)
    }

    fn end(self) -> Result<CasePart, FlattenError> {
        Ok(CasePart::joined(self.fields))
    }
}

impl ser::SerializeStructVariant for StructFlattener {
    type Ok = CasePart;
    type Error = FlattenError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> Result<(), FlattenError> {
        self.push(value)
    }

    fn end(self) -> Result<CasePart, FlattenError> {
        Ok(CasePart::joined(self.fields))
    }
}
