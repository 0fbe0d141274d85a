//! The extension-buffer encoding: little-endian primitives plus the
//! compound MAPI types (tagged propvals, proplists, restrictions, property
//! names) shared by the exmdb wire protocol, FastTransfer streams and the
//! on-disk property blobs.
//!
//! Every type has an encode/decode pair; a decode of an encode must yield
//! the original value. Malformed input surfaces as `EcError::RpcFormat`.

use uuid::Uuid;

use crate::types::propval::{
    self, PropList, PropName, PropValue, TaggedPropval, PT_UNSPECIFIED,
};
use crate::types::restriction::{Restriction, SortKey, SortOrderSet};
use crate::types::{guid_from_wire, guid_to_wire, EcError, EcResult};

/// Read cursor over a received buffer.
pub struct ExtPull<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ExtPull<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    fn take(&mut self, n: usize) -> EcResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(EcError::RpcFormat);
        }
        let out = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> EcResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> EcResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn u32(&mut self) -> EcResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> EcResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn f32(&mut self) -> EcResult<f32> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn f64(&mut self) -> EcResult<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn bool(&mut self) -> EcResult<bool> {
        Ok(self.u8()? != 0)
    }

    pub fn bytes(&mut self, n: usize) -> EcResult<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }

    /// Length-prefixed binary (u32 count).
    pub fn bin(&mut self) -> EcResult<Vec<u8>> {
        let n = self.u32()? as usize;
        self.bytes(n)
    }

    /// NUL-terminated UTF-8 string.
    pub fn str(&mut self) -> EcResult<String> {
        let rest = &self.data[self.offset..];
        let nul = rest.iter().position(|&b| b == 0).ok_or(EcError::RpcFormat)?;
        let s = std::str::from_utf8(&rest[..nul]).map_err(|_| EcError::RpcFormat)?;
        self.offset += nul + 1;
        Ok(s.to_owned())
    }

    /// NUL-terminated UTF-16LE string.
    pub fn wstr(&mut self) -> EcResult<String> {
        let rest = &self.data[self.offset..];
        let mut units = Vec::new();
        let mut i = 0;
        loop {
            if i + 2 > rest.len() {
                return Err(EcError::RpcFormat);
            }
            let u = u16::from_le_bytes([rest[i], rest[i + 1]]);
            i += 2;
            if u == 0 {
                break;
            }
            units.push(u);
        }
        self.offset += i;
        String::from_utf16(&units).map_err(|_| EcError::RpcFormat)
    }

    pub fn guid(&mut self) -> EcResult<Uuid> {
        guid_from_wire(self.take(16)?).ok_or(EcError::RpcFormat)
    }

    pub fn opt<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> EcResult<T>,
    ) -> EcResult<Option<T>> {
        if self.u8()? == 0 {
            Ok(None)
        } else {
            Ok(Some(f(self)?))
        }
    }

    pub fn propvalue(&mut self, proptype: u16) -> EcResult<PropValue> {
        use propval::*;
        Ok(match proptype {
            PT_NULL | PT_UNSPECIFIED => PropValue::Null,
            PT_SHORT => PropValue::Short(self.u16()?),
            PT_LONG => PropValue::Long(self.u32()?),
            PT_FLOAT => PropValue::Float(self.f32()?),
            PT_DOUBLE => PropValue::Double(self.f64()?),
            PT_CURRENCY => PropValue::Currency(self.u64()?),
            PT_APPTIME => PropValue::AppTime(self.f64()?),
            PT_ERROR => PropValue::Error(self.u32()?),
            PT_BOOLEAN => PropValue::Bool(self.bool()?),
            PT_I8 => PropValue::I8(self.u64()?),
            PT_STRING8 => PropValue::String8(self.str()?),
            PT_UNICODE => PropValue::Unicode(self.str()?),
            PT_SYSTIME => PropValue::SysTime(self.u64()?),
            PT_CLSID => PropValue::Guid(self.guid()?),
            PT_SVREID => PropValue::SvrEid(self.bin()?),
            PT_BINARY => PropValue::Binary(self.bin()?),
            PT_OBJECT => PropValue::Object(self.bin()?),
            PT_MV_SHORT => {
                let n = self.u32()? as usize;
                PropValue::MvShort((0..n).map(|_| self.u16()).collect::<EcResult<_>>()?)
            }
            PT_MV_LONG => {
                let n = self.u32()? as usize;
                PropValue::MvLong((0..n).map(|_| self.u32()).collect::<EcResult<_>>()?)
            }
            PT_MV_I8 => {
                let n = self.u32()? as usize;
                PropValue::MvI8((0..n).map(|_| self.u64()).collect::<EcResult<_>>()?)
            }
            PT_MV_STRING8 => {
                let n = self.u32()? as usize;
                PropValue::MvString8((0..n).map(|_| self.str()).collect::<EcResult<_>>()?)
            }
            PT_MV_UNICODE => {
                let n = self.u32()? as usize;
                PropValue::MvUnicode((0..n).map(|_| self.str()).collect::<EcResult<_>>()?)
            }
            PT_MV_CLSID => {
                let n = self.u32()? as usize;
                PropValue::MvGuid((0..n).map(|_| self.guid()).collect::<EcResult<_>>()?)
            }
            PT_MV_BINARY => {
                let n = self.u32()? as usize;
                PropValue::MvBinary((0..n).map(|_| self.bin()).collect::<EcResult<_>>()?)
            }
            _ => return Err(EcError::RpcFormat),
        })
    }

    pub fn tagged_propval(&mut self) -> EcResult<TaggedPropval> {
        let tag = self.u32()?;
        let value = self.propvalue(propval::tag_type(tag))?;
        Ok(TaggedPropval { tag, value })
    }

    pub fn proplist(&mut self) -> EcResult<PropList> {
        let n = self.u16()? as usize;
        (0..n).map(|_| self.tagged_propval()).collect::<EcResult<_>>()
    }

    pub fn proptags(&mut self) -> EcResult<Vec<u32>> {
        let n = self.u16()? as usize;
        (0..n).map(|_| self.u32()).collect::<EcResult<_>>()
    }

    pub fn propname(&mut self) -> EcResult<PropName> {
        let kind = self.u8()?;
        let guid = self.guid()?;
        match kind {
            0 => Ok(PropName::Lid { guid, lid: self.u32()? }),
            1 => Ok(PropName::Name { guid, name: self.str()? }),
            _ => Err(EcError::RpcFormat),
        }
    }

    pub fn propnames(&mut self) -> EcResult<Vec<PropName>> {
        let n = self.u16()? as usize;
        (0..n).map(|_| self.propname()).collect::<EcResult<_>>()
    }

    pub fn restriction(&mut self) -> EcResult<Restriction> {
        self.restriction_depth(0)
    }

    fn restriction_depth(&mut self, depth: u32) -> EcResult<Restriction> {
        if depth > 32 {
            return Err(EcError::TooComplex);
        }
        let rt = self.u8()?;
        Ok(match rt {
            0x00 | 0x01 => {
                let n = self.u32()? as usize;
                let list = (0..n)
                    .map(|_| self.restriction_depth(depth + 1))
                    .collect::<EcResult<Vec<_>>>()?;
                if rt == 0x00 {
                    Restriction::And(list)
                } else {
                    Restriction::Or(list)
                }
            }
            0x02 => Restriction::Not(Box::new(self.restriction_depth(depth + 1)?)),
            0x03 => {
                let fuzzy_level = self.u32()?;
                let proptag = self.u32()?;
                let tp = self.tagged_propval()?;
                Restriction::Content { fuzzy_level, proptag, propval: tp.value }
            }
            0x04 => {
                let relop = self.u8()?;
                let proptag = self.u32()?;
                let tp = self.tagged_propval()?;
                Restriction::Property { relop, proptag, propval: tp.value }
            }
            0x05 => Restriction::PropCompare {
                relop: self.u8()?,
                proptag1: self.u32()?,
                proptag2: self.u32()?,
            },
            0x06 => Restriction::Bitmask {
                relop: self.u8()?,
                proptag: self.u32()?,
                mask: self.u32()?,
            },
            0x07 => Restriction::Size {
                relop: self.u8()?,
                proptag: self.u32()?,
                size: self.u32()?,
            },
            0x08 => Restriction::Exist { proptag: self.u32()? },
            0x09 => Restriction::Sub {
                subobject: self.u32()?,
                res: Box::new(self.restriction_depth(depth + 1)?),
            },
            0x0A => {
                let n = self.u8()? as usize;
                let props = (0..n)
                    .map(|_| self.tagged_propval())
                    .collect::<EcResult<Vec<_>>>()?;
                let res = self
                    .opt(|p| p.restriction_depth(depth + 1))?
                    .map(Box::new);
                Restriction::Comment { props, res }
            }
            0x0B => Restriction::Count {
                count: self.u32()?,
                res: Box::new(self.restriction_depth(depth + 1)?),
            },
            0xFF => Restriction::Null,
            _ => return Err(EcError::RpcFormat),
        })
    }

    pub fn sort_order_set(&mut self) -> EcResult<SortOrderSet> {
        let count = self.u16()? as usize;
        let ccategories = self.u16()?;
        let cexpanded = self.u16()?;
        if usize::from(ccategories) > count || cexpanded > ccategories {
            return Err(EcError::RpcFormat);
        }
        let keys = (0..count)
            .map(|_| {
                let proptag = self.u32()?;
                let descending = self.u8()? != 0;
                Ok(SortKey { proptag, descending })
            })
            .collect::<EcResult<_>>()?;
        Ok(SortOrderSet { ccategories, cexpanded, keys })
    }
}

/// Write cursor producing a wire buffer.
#[derive(Default)]
pub struct ExtPush {
    buf: Vec<u8>,
}

impl ExtPush {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn bool(&mut self, v: bool) {
        self.u8(u8::from(v));
    }

    pub fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub fn bin(&mut self, v: &[u8]) {
        self.u32(v.len() as u32);
        self.bytes(v);
    }

    pub fn str(&mut self, v: &str) {
        self.bytes(v.as_bytes());
        self.u8(0);
    }

    pub fn wstr(&mut self, v: &str) {
        for unit in v.encode_utf16() {
            self.u16(unit);
        }
        self.u16(0);
    }

    pub fn guid(&mut self, g: Uuid) {
        self.bytes(&guid_to_wire(g));
    }

    pub fn opt<T>(&mut self, v: Option<&T>, f: impl FnOnce(&mut Self, &T)) {
        match v {
            None => self.u8(0),
            Some(v) => {
                self.u8(1);
                f(self, v);
            }
        }
    }

    pub fn propvalue(&mut self, v: &PropValue) {
        match v {
            PropValue::Null => {}
            PropValue::Short(x) => self.u16(*x),
            PropValue::Long(x) | PropValue::Error(x) => self.u32(*x),
            PropValue::Float(x) => self.f32(*x),
            PropValue::Double(x) | PropValue::AppTime(x) => self.f64(*x),
            PropValue::Currency(x) | PropValue::I8(x) | PropValue::SysTime(x) => self.u64(*x),
            PropValue::Bool(x) => self.bool(*x),
            PropValue::String8(s) | PropValue::Unicode(s) => self.str(s),
            PropValue::Guid(g) => self.guid(*g),
            PropValue::SvrEid(b) | PropValue::Binary(b) | PropValue::Object(b) => self.bin(b),
            PropValue::MvShort(xs) => {
                self.u32(xs.len() as u32);
                for x in xs {
                    self.u16(*x);
                }
            }
            PropValue::MvLong(xs) => {
                self.u32(xs.len() as u32);
                for x in xs {
                    self.u32(*x);
                }
            }
            PropValue::MvI8(xs) => {
                self.u32(xs.len() as u32);
                for x in xs {
                    self.u64(*x);
                }
            }
            PropValue::MvString8(xs) | PropValue::MvUnicode(xs) => {
                self.u32(xs.len() as u32);
                for x in xs {
                    self.str(x);
                }
            }
            PropValue::MvGuid(xs) => {
                self.u32(xs.len() as u32);
                for x in xs {
                    self.guid(*x);
                }
            }
            PropValue::MvBinary(xs) => {
                self.u32(xs.len() as u32);
                for x in xs {
                    self.bin(x);
                }
            }
        }
    }

    pub fn tagged_propval(&mut self, tp: &TaggedPropval) {
        // Values carry their own type; an untyped tag is re-typed so the
        // decoder never sees PT_UNSPECIFIED with a payload.
        let tag = if propval::tag_type(tp.tag) == PT_UNSPECIFIED {
            propval::change_tag_type(tp.tag, tp.value.proptype())
        } else {
            tp.tag
        };
        self.u32(tag);
        self.propvalue(&tp.value);
    }

    pub fn proplist(&mut self, list: &PropList) {
        self.u16(list.len() as u16);
        for tp in list.iter() {
            self.tagged_propval(tp);
        }
    }

    pub fn proptags(&mut self, tags: &[u32]) {
        self.u16(tags.len() as u16);
        for t in tags {
            self.u32(*t);
        }
    }

    pub fn propname(&mut self, name: &PropName) {
        match name {
            PropName::Lid { guid, lid } => {
                self.u8(0);
                self.guid(*guid);
                self.u32(*lid);
            }
            PropName::Name { guid, name } => {
                self.u8(1);
                self.guid(*guid);
                self.str(name);
            }
        }
    }

    pub fn propnames(&mut self, names: &[PropName]) {
        self.u16(names.len() as u16);
        for n in names {
            self.propname(n);
        }
    }

    pub fn restriction(&mut self, res: &Restriction) {
        match res {
            Restriction::And(list) | Restriction::Or(list) => {
                self.u8(if matches!(res, Restriction::And(_)) { 0x00 } else { 0x01 });
                self.u32(list.len() as u32);
                for r in list {
                    self.restriction(r);
                }
            }
            Restriction::Not(r) => {
                self.u8(0x02);
                self.restriction(r);
            }
            Restriction::Content { fuzzy_level, proptag, propval } => {
                self.u8(0x03);
                self.u32(*fuzzy_level);
                self.u32(*proptag);
                self.tagged_propval(&TaggedPropval::new(
                    propval::change_tag_type(*proptag, propval.proptype()),
                    propval.clone(),
                ));
            }
            Restriction::Property { relop, proptag, propval } => {
                self.u8(0x04);
                self.u8(*relop);
                self.u32(*proptag);
                self.tagged_propval(&TaggedPropval::new(
                    propval::change_tag_type(*proptag, propval.proptype()),
                    propval.clone(),
                ));
            }
            Restriction::PropCompare { relop, proptag1, proptag2 } => {
                self.u8(0x05);
                self.u8(*relop);
                self.u32(*proptag1);
                self.u32(*proptag2);
            }
            Restriction::Bitmask { relop, proptag, mask } => {
                self.u8(0x06);
                self.u8(*relop);
                self.u32(*proptag);
                self.u32(*mask);
            }
            Restriction::Size { relop, proptag, size } => {
                self.u8(0x07);
                self.u8(*relop);
                self.u32(*proptag);
                self.u32(*size);
            }
            Restriction::Exist { proptag } => {
                self.u8(0x08);
                self.u32(*proptag);
            }
            Restriction::Sub { subobject, res } => {
                self.u8(0x09);
                self.u32(*subobject);
                self.restriction(res);
            }
            Restriction::Comment { props, res } => {
                self.u8(0x0A);
                self.u8(props.len() as u8);
                for tp in props {
                    self.tagged_propval(tp);
                }
                self.opt(res.as_deref(), |p, r| p.restriction(r));
            }
            Restriction::Count { count, res } => {
                self.u8(0x0B);
                self.u32(*count);
                self.restriction(res);
            }
            Restriction::Null => self.u8(0xFF),
        }
    }

    pub fn sort_order_set(&mut self, set: &SortOrderSet) {
        self.u16(set.keys.len() as u16);
        self.u16(set.ccategories);
        self.u16(set.cexpanded);
        for key in &set.keys {
            self.u32(key.proptag);
            self.u8(u8::from(key.descending));
        }
    }
}

/// Encode a bare property value (no tag), the form stored in the
/// `*_properties` tables.
pub fn encode_propvalue(v: &PropValue) -> Vec<u8> {
    let mut push = ExtPush::new();
    push.propvalue(v);
    push.into_bytes()
}

/// Inverse of [`encode_propvalue`], given the proptype from the tag.
pub fn decode_propvalue(proptype: u16, bytes: &[u8]) -> EcResult<PropValue> {
    let mut pull = ExtPull::new(bytes);
    let v = pull.propvalue(proptype)?;
    if pull.remaining() != 0 {
        return Err(EcError::CorruptData);
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::propval::{tags, PT_UNICODE};
    use crate::types::restriction::{FL_SUBSTRING, RELOP_GE};

    #[test]
    fn primitive_round_trip() {
        let mut push = ExtPush::new();
        push.u8(7);
        push.u16(0xBEEF);
        push.u32(0xDEAD_BEEF);
        push.u64(0x0123_4567_89AB_CDEF);
        push.str("hello");
        push.bin(b"abc");
        let g = Uuid::new_v4();
        push.guid(g);
        let bytes = push.into_bytes();

        let mut pull = ExtPull::new(&bytes);
        assert_eq!(pull.u8().unwrap(), 7);
        assert_eq!(pull.u16().unwrap(), 0xBEEF);
        assert_eq!(pull.u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(pull.u64().unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(pull.str().unwrap(), "hello");
        assert_eq!(pull.bin().unwrap(), b"abc");
        assert_eq!(pull.guid().unwrap(), g);
        assert_eq!(pull.remaining(), 0);
    }

    #[test]
    fn proplist_round_trip() {
        let mut list = PropList::new();
        list.set(tags::PR_SUBJECT, PropValue::Unicode("hi".into()));
        list.set(tags::PR_MESSAGE_SIZE, PropValue::Long(42));
        list.set(tags::PR_CHANGE_KEY, PropValue::Binary(vec![1, 2, 3]));
        list.set(tags::PR_MID, PropValue::I8(0x0001_0000_0000_1234));

        let mut push = ExtPush::new();
        push.proplist(&list);
        let bytes = push.into_bytes();
        let decoded = ExtPull::new(&bytes).proplist().unwrap();
        assert_eq!(decoded, list);
    }

    #[test]
    fn restriction_round_trip() {
        let res = Restriction::And(vec![
            Restriction::Content {
                fuzzy_level: FL_SUBSTRING,
                proptag: tags::PR_SUBJECT,
                propval: PropValue::Unicode("x".into()),
            },
            Restriction::Not(Box::new(Restriction::Exist {
                proptag: tags::PR_BODY,
            })),
            Restriction::Property {
                relop: RELOP_GE,
                proptag: tags::PR_MESSAGE_SIZE,
                propval: PropValue::Long(9),
            },
            Restriction::Null,
        ]);
        let mut push = ExtPush::new();
        push.restriction(&res);
        let bytes = push.into_bytes();
        assert_eq!(ExtPull::new(&bytes).restriction().unwrap(), res);
    }

    #[test]
    fn propname_round_trip() {
        let names = vec![
            PropName::Lid { guid: Uuid::new_v4(), lid: 0x8501 },
            PropName::Name { guid: Uuid::new_v4(), name: "Keywords".into() },
        ];
        let mut push = ExtPush::new();
        push.propnames(&names);
        let bytes = push.into_bytes();
        assert_eq!(ExtPull::new(&bytes).propnames().unwrap(), names);
    }

    #[test]
    fn truncated_input_is_rpc_format() {
        let mut push = ExtPush::new();
        push.proplist(&PropList::new());
        let mut bytes = push.into_bytes();
        bytes[0] = 5; // claim five entries, provide none
        assert_eq!(
            ExtPull::new(&bytes).proplist().unwrap_err(),
            EcError::RpcFormat
        );
    }

    #[test]
    fn stored_value_round_trip() {
        let v = PropValue::Unicode("body".into());
        let bytes = encode_propvalue(&v);
        assert_eq!(decode_propvalue(PT_UNICODE, &bytes).unwrap(), v);
    }
}
