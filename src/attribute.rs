//! Entry attribute model.

use lber::structures::{OctetString, Sequence, Set, Tag};

/// A partial attribute: a type name and its values.
///
/// LDAP transmits every value as an octet string, so values are kept as
/// byte vectors here; the search machinery converts them to `String`s on
/// the way out when they hold valid UTF-8.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attribute {
    /// Attribute type description.
    pub name: String,
    /// Attribute values, in submission order.
    pub values: Vec<Vec<u8>>,
}

impl Attribute {
    /// An attribute with no values yet.
    pub fn new<S: Into<String>>(name: S) -> Attribute {
        Attribute {
            name: name.into(),
            values: Vec::new(),
        }
    }

    /// Append a value, textual or binary.
    pub fn value<V: Into<Vec<u8>>>(mut self, val: V) -> Attribute {
        self.values.push(val.into());
        self
    }

    /// Encode as `SEQUENCE { type, SET OF value }`.
    pub(crate) fn into_tag(self) -> Tag {
        Tag::Sequence(Sequence {
            inner: vec![
                Tag::OctetString(OctetString {
                    inner: self.name.into_bytes(),
                    ..Default::default()
                }),
                Tag::Set(Set {
                    inner: self
                        .values
                        .into_iter()
                        .map(|v| {
                            Tag::OctetString(OctetString {
                                inner: v,
                                ..Default::default()
                            })
                        })
                        .collect(),
                    ..Default::default()
                }),
            ],
            ..Default::default()
        })
    }
}

impl<N, V> From<(N, Vec<V>)> for Attribute
where
    N: Into<String>,
    V: Into<Vec<u8>>,
{
    fn from((name, values): (N, Vec<V>)) -> Attribute {
        Attribute {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::Attribute;

    #[test]
    fn attr_builder() {
        let a = Attribute::new("objectClass").value("top").value("person");
        assert_eq!(a.name, "objectClass");
        assert_eq!(a.values, vec![b"top".to_vec(), b"person".to_vec()]);
    }

    #[test]
    fn attr_from_tuple() {
        let a = Attribute::from(("jpegPhoto", vec![vec![0xffu8, 0xd8]]));
        assert_eq!(a.values[0], vec![0xff, 0xd8]);
    }
}
