//! Restrictions (MAPI filters) and sort orders, plus an evaluator over
//! property lists. Search-folder population and table loading both run
//! through [`Restriction::eval`].

use super::propval::{tag_type, PropList, PropValue, PT_STRING8, PT_UNICODE};

pub const RELOP_LT: u8 = 0x00;
pub const RELOP_LE: u8 = 0x01;
pub const RELOP_GT: u8 = 0x02;
pub const RELOP_GE: u8 = 0x03;
pub const RELOP_EQ: u8 = 0x04;
pub const RELOP_NE: u8 = 0x05;
pub const RELOP_RE: u8 = 0x06;

pub const FL_FULLSTRING: u32 = 0x0000;
pub const FL_SUBSTRING: u32 = 0x0001;
pub const FL_PREFIX: u32 = 0x0002;
pub const FL_IGNORECASE: u32 = 0x0001_0000;

pub const BMR_EQZ: u8 = 0x00;
pub const BMR_NEZ: u8 = 0x01;

#[derive(Debug, Clone, PartialEq)]
pub enum Restriction {
    And(Vec<Restriction>),
    Or(Vec<Restriction>),
    Not(Box<Restriction>),
    Content { fuzzy_level: u32, proptag: u32, propval: PropValue },
    Property { relop: u8, proptag: u32, propval: PropValue },
    PropCompare { relop: u8, proptag1: u32, proptag2: u32 },
    Bitmask { relop: u8, proptag: u32, mask: u32 },
    Size { relop: u8, proptag: u32, size: u32 },
    Exist { proptag: u32 },
    Sub { subobject: u32, res: Box<Restriction> },
    Comment { props: Vec<super::propval::TaggedPropval>, res: Option<Box<Restriction>> },
    Count { count: u32, res: Box<Restriction> },
    Null,
}

fn cmp_values(a: &PropValue, b: &PropValue) -> Option<std::cmp::Ordering> {
    use PropValue as V;
    match (a, b) {
        (V::String8(x) | V::Unicode(x), V::String8(y) | V::Unicode(y)) => {
            Some(x.to_lowercase().cmp(&y.to_lowercase()))
        }
        (V::Binary(x), V::Binary(y)) => Some(x.cmp(y)),
        (V::Float(x), V::Float(y)) => x.partial_cmp(y),
        (V::Double(x) | V::AppTime(x), V::Double(y) | V::AppTime(y)) => x.partial_cmp(y),
        (V::Bool(x), V::Bool(y)) => Some(x.cmp(y)),
        _ => match (a.as_u64(), b.as_u64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => None,
        },
    }
}

fn relop_holds(relop: u8, ord: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match relop {
        RELOP_LT => ord == Less,
        RELOP_LE => ord != Greater,
        RELOP_GT => ord == Greater,
        RELOP_GE => ord != Less,
        RELOP_EQ => ord == Equal,
        RELOP_NE => ord != Equal,
        _ => false,
    }
}

impl Restriction {
    /// Evaluate against a flat property list. Sub-object restrictions
    /// (recipients, attachments) are not resolvable here and evaluate
    /// to false; the table layer expands them before calling.
    pub fn eval(&self, props: &PropList) -> bool {
        match self {
            Self::And(list) => list.iter().all(|r| r.eval(props)),
            Self::Or(list) => list.iter().any(|r| r.eval(props)),
            Self::Not(r) => !r.eval(props),
            Self::Content { fuzzy_level, proptag, propval } => {
                let Some(have) = props.get(*proptag) else { return false };
                let (Some(hay), Some(needle)) = (have.as_str(), propval.as_str()) else {
                    return false;
                };
                let ignore_case = fuzzy_level & FL_IGNORECASE != 0;
                let (hay, needle) = if ignore_case {
                    (hay.to_lowercase(), needle.to_lowercase())
                } else {
                    (hay.to_owned(), needle.to_owned())
                };
                match fuzzy_level & 0xFFFF {
                    FL_SUBSTRING => hay.contains(&needle),
                    FL_PREFIX => hay.starts_with(&needle),
                    _ => hay == needle,
                }
            }
            Self::Property { relop, proptag, propval } => {
                let Some(have) = props.get(*proptag) else { return false };
                cmp_values(have, propval).is_some_and(|o| relop_holds(*relop, o))
            }
            Self::PropCompare { relop, proptag1, proptag2 } => {
                let (Some(a), Some(b)) = (props.get(*proptag1), props.get(*proptag2)) else {
                    return false;
                };
                cmp_values(a, b).is_some_and(|o| relop_holds(*relop, o))
            }
            Self::Bitmask { relop, proptag, mask } => {
                let Some(v) = props.get(*proptag).and_then(|v| v.as_u32()) else {
                    return false;
                };
                match *relop {
                    BMR_EQZ => v & mask == 0,
                    BMR_NEZ => v & mask != 0,
                    _ => false,
                }
            }
            Self::Size { relop, proptag, size } => {
                let Some(v) = props.get(*proptag) else { return false };
                let actual = match v {
                    PropValue::Binary(b) | PropValue::Object(b) => b.len() as u32,
                    PropValue::String8(s) => s.len() as u32 + 1,
                    PropValue::Unicode(s) => (s.encode_utf16().count() as u32 + 1) * 2,
                    _ => return false,
                };
                relop_holds(*relop, actual.cmp(size))
            }
            Self::Exist { proptag } => {
                // A string tag matches either string width.
                if props.get(*proptag).is_some() {
                    return true;
                }
                let ty = tag_type(*proptag);
                if ty == PT_UNICODE || ty == PT_STRING8 {
                    let other = if ty == PT_UNICODE { PT_STRING8 } else { PT_UNICODE };
                    return props
                        .get(super::propval::change_tag_type(*proptag, other))
                        .is_some();
                }
                false
            }
            Self::Sub { .. } => false,
            Self::Comment { res, .. } => res.as_ref().is_some_and(|r| r.eval(props)),
            Self::Count { res, .. } => res.eval(props),
            Self::Null => true,
        }
    }
}

/// One sort key of a table sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub proptag: u32,
    pub descending: bool,
}

/// Sort specification: the first `ccategories` keys group rows into
/// category headers; of those, the first `cexpanded` start expanded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortOrderSet {
    pub ccategories: u16,
    pub cexpanded: u16,
    pub keys: Vec<SortKey>,
}

impl SortOrderSet {
    pub fn compare(&self, a: &PropList, b: &PropList) -> std::cmp::Ordering {
        for key in &self.keys {
            let ord = match (a.get(key.proptag), b.get(key.proptag)) {
                (Some(x), Some(y)) => cmp_values(x, y).unwrap_or(std::cmp::Ordering::Equal),
                (Some(_), None) => std::cmp::Ordering::Greater,
                (None, Some(_)) => std::cmp::Ordering::Less,
                (None, None) => std::cmp::Ordering::Equal,
            };
            let ord = if key.descending { ord.reverse() } else { ord };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::propval::tags;

    fn props(subject: &str, size: u32) -> PropList {
        let mut p = PropList::new();
        p.set(tags::PR_SUBJECT, PropValue::Unicode(subject.into()));
        p.set(tags::PR_MESSAGE_SIZE, PropValue::Long(size));
        p
    }

    #[test]
    fn content_substring_ignore_case() {
        let r = Restriction::Content {
            fuzzy_level: FL_SUBSTRING | FL_IGNORECASE,
            proptag: tags::PR_SUBJECT,
            propval: PropValue::Unicode("INVOICE".into()),
        };
        assert!(r.eval(&props("Your invoice #42", 10)));
        assert!(!r.eval(&props("receipt", 10)));
    }

    #[test]
    fn property_relops() {
        let r = Restriction::Property {
            relop: RELOP_GT,
            proptag: tags::PR_MESSAGE_SIZE,
            propval: PropValue::Long(100),
        };
        assert!(r.eval(&props("x", 200)));
        assert!(!r.eval(&props("x", 100)));
    }

    #[test]
    fn and_or_not() {
        let gt = Restriction::Property {
            relop: RELOP_GT,
            proptag: tags::PR_MESSAGE_SIZE,
            propval: PropValue::Long(100),
        };
        let has = Restriction::Exist { proptag: tags::PR_SUBJECT };
        assert!(Restriction::And(vec![gt.clone(), has.clone()]).eval(&props("x", 200)));
        assert!(Restriction::Or(vec![gt.clone(), has]).eval(&props("x", 50)));
        assert!(!Restriction::Not(Box::new(gt)).eval(&props("x", 200)));
    }

    #[test]
    fn sort_order_categories() {
        let set = SortOrderSet {
            ccategories: 0,
            cexpanded: 0,
            keys: vec![SortKey { proptag: tags::PR_MESSAGE_SIZE, descending: true }],
        };
        assert_eq!(set.compare(&props("a", 10), &props("b", 20)), std::cmp::Ordering::Greater);
    }
}
