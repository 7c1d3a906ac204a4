//! Decoder for the `pgoutput` logical-decoding plugin (protocol version 1).
//!
//! The puller reads raw pgoutput frames from
//! `pg_logical_slot_peek_binary_changes` and turns them into typed messages.
//! Column values arrive in text form; `decode_row` converts them to JSON
//! using the type OIDs carried by the preceding `Relation` message.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tether_db::Row;

use crate::lww;

/// Postgres type OIDs the converter special-cases.
mod oid {
    pub const BOOL: u32 = 16;
    pub const INT8: u32 = 20;
    pub const INT2: u32 = 21;
    pub const INT4: u32 = 23;
    pub const OID: u32 = 26;
    pub const FLOAT4: u32 = 700;
    pub const FLOAT8: u32 = 701;
    pub const NUMERIC: u32 = 1700;
    pub const JSON: u32 = 114;
    pub const JSONB: u32 = 3802;
    pub const TIMESTAMP: u32 = 1114;
    pub const TIMESTAMPTZ: u32 = 1184;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Begin {
        final_lsn: u64,
        commit_ts_micros: i64,
        xid: u32,
    },
    Commit {
        commit_lsn: u64,
        end_lsn: u64,
    },
    /// The transaction being decoded was produced by the named replication
    /// origin.
    Origin { name: String },
    Relation(Relation),
    Insert {
        rel_id: u32,
        new: TupleData,
    },
    Update {
        rel_id: u32,
        old: Option<TupleData>,
        new: TupleData,
    },
    Delete {
        rel_id: u32,
        key: TupleData,
    },
    Truncate {
        rel_ids: Vec<u32>,
    },
    /// Type metadata, keepalives, logical messages: ignored.
    Other(u8),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<RelationColumn>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationColumn {
    pub key_part: bool,
    pub name: String,
    pub type_oid: u32,
}

pub type TupleData = Vec<TupleValue>;

#[derive(Debug, Clone, PartialEq)]
pub enum TupleValue {
    Null,
    /// Unchanged TOAST datum; the value was not sent and must not overwrite.
    UnchangedToast,
    Text(String),
}

pub fn decode_message(buf: &[u8]) -> Result<Message> {
    let mut r = Reader::new(buf);
    let tag = r.u8().context("message tag")?;
    let msg = match tag {
        b'B' => Message::Begin {
            final_lsn: r.u64()?,
            commit_ts_micros: r.i64()?,
            xid: r.u32()?,
        },
        b'C' => {
            let _flags = r.u8()?;
            Message::Commit {
                commit_lsn: r.u64()?,
                end_lsn: r.u64()?,
            }
        }
        b'O' => {
            let _origin_commit_lsn = r.u64()?;
            Message::Origin { name: r.cstr()? }
        }
        b'R' => {
            let id = r.u32()?;
            let namespace = r.cstr()?;
            let name = r.cstr()?;
            let replica_identity = r.u8()?;
            let ncols = r.u16()?;
            let mut columns = Vec::with_capacity(ncols as usize);
            for _ in 0..ncols {
                let flags = r.u8()?;
                let name = r.cstr()?;
                let type_oid = r.u32()?;
                let _typmod = r.u32()?;
                columns.push(RelationColumn {
                    key_part: flags & 1 != 0,
                    name,
                    type_oid,
                });
            }
            Message::Relation(Relation {
                id,
                namespace,
                name,
                replica_identity,
                columns,
            })
        }
        b'I' => {
            let rel_id = r.u32()?;
            let kind = r.u8()?;
            if kind != b'N' {
                bail!("insert tuple kind {kind:?} unexpected");
            }
            Message::Insert {
                rel_id,
                new: r.tuple()?,
            }
        }
        b'U' => {
            let rel_id = r.u32()?;
            let mut old = None;
            let mut kind = r.u8()?;
            if kind == b'K' || kind == b'O' {
                old = Some(r.tuple()?);
                kind = r.u8()?;
            }
            if kind != b'N' {
                bail!("update tuple kind {kind:?} unexpected");
            }
            Message::Update {
                rel_id,
                old,
                new: r.tuple()?,
            }
        }
        b'D' => {
            let rel_id = r.u32()?;
            let kind = r.u8()?;
            if kind != b'K' && kind != b'O' {
                bail!("delete tuple kind {kind:?} unexpected");
            }
            Message::Delete {
                rel_id,
                key: r.tuple()?,
            }
        }
        b'T' => {
            let ntables = r.u32()?;
            let _options = r.u8()?;
            let mut rel_ids = Vec::with_capacity(ntables as usize);
            for _ in 0..ntables {
                rel_ids.push(r.u32()?);
            }
            Message::Truncate { rel_ids }
        }
        other => Message::Other(other),
    };
    Ok(msg)
}

/// Zip a tuple with its relation's columns into a JSON row. Unchanged TOAST
/// values are omitted so downstream column-intersection never overwrites
/// them. Timestamp columns are normalized to RFC 3339 UTC.
pub fn decode_row(relation: &Relation, tuple: &TupleData) -> Result<Row> {
    if tuple.len() != relation.columns.len() {
        bail!(
            "tuple width {} does not match relation {} ({} columns)",
            tuple.len(),
            relation.name,
            relation.columns.len()
        );
    }
    let mut row = Row::new();
    for (col, val) in relation.columns.iter().zip(tuple) {
        match val {
            TupleValue::UnchangedToast => {}
            TupleValue::Null => {
                row.insert(col.name.clone(), Value::Null);
            }
            TupleValue::Text(text) => {
                row.insert(col.name.clone(), convert_text(col.type_oid, text));
            }
        }
    }
    Ok(row)
}

fn convert_text(type_oid: u32, text: &str) -> Value {
    match type_oid {
        oid::BOOL => Value::Bool(text == "t" || text == "true"),
        oid::INT2 | oid::INT4 | oid::INT8 | oid::OID => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        oid::FLOAT4 | oid::FLOAT8 | oid::NUMERIC => {
            if let Ok(i) = text.parse::<i64>() {
                Value::from(i)
            } else if let Some(n) = text
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
            {
                Value::Number(n)
            } else {
                Value::String(text.to_string())
            }
        }
        oid::JSON | oid::JSONB => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        }
        oid::TIMESTAMP | oid::TIMESTAMPTZ => Value::String(
            lww::normalize_timestamp(text).unwrap_or_else(|| text.to_string()),
        ),
        _ => Value::String(text.to_string()),
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            bail!("pgoutput message truncated at byte {}", self.pos);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn cstr(&mut self) -> Result<String> {
        let start = self.pos;
        while self.pos < self.buf.len() && self.buf[self.pos] != 0 {
            self.pos += 1;
        }
        if self.pos >= self.buf.len() {
            bail!("unterminated string in pgoutput message");
        }
        let s = String::from_utf8_lossy(&self.buf[start..self.pos]).into_owned();
        self.pos += 1;
        Ok(s)
    }

    fn tuple(&mut self) -> Result<TupleData> {
        let ncols = self.u16()?;
        let mut values = Vec::with_capacity(ncols as usize);
        for _ in 0..ncols {
            let kind = self.u8()?;
            values.push(match kind {
                b'n' => TupleValue::Null,
                b'u' => TupleValue::UnchangedToast,
                b't' => {
                    let len = self.i32()?;
                    if len < 0 {
                        bail!("negative tuple value length");
                    }
                    let bytes = self.take(len as usize)?;
                    TupleValue::Text(String::from_utf8_lossy(bytes).into_owned())
                }
                other => bail!("unknown tuple value kind {other:?}"),
            });
        }
        Ok(values)
    }
}
