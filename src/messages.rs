//! Typed protocol requests and their BER encoders.
//!
//! Every LDAP operation is a variant of [`Request`]. A variant knows its
//! application-class protocol-op tag and how to serialize its body; the
//! codec wraps the result in the common message envelope together with the
//! message ID and any request controls. Responses share the `LDAPResult`
//! shape and are decoded in [`crate::result`] and [`crate::search`].

use std::fmt;

use lber::common::TagClass;
use lber::structures::{Boolean, Enumerated, Integer, Null, OctetString, Sequence, Set, Tag};

use crate::attribute::Attribute;
use crate::exop_impl::{construct_exop, Exop};
use crate::filter::Filter;
use crate::ldap::Mod;
use crate::search::{DerefAliases, Scope};
use crate::RequestId;

/// Parameters of a Search request.
#[derive(Clone, Debug)]
pub struct SearchParams {
    pub base: String,
    pub scope: Scope,
    pub deref: DerefAliases,
    pub sizelimit: i32,
    pub timelimit: i32,
    pub typesonly: bool,
    pub filter: Filter,
    pub attrs: Vec<String>,
}

/// A protocol request, one variant per operation.
#[derive(Clone)]
pub enum Request {
    SimpleBind { dn: String, password: String },
    SaslBind { mechanism: String, credentials: Option<Vec<u8>> },
    Unbind,
    Abandon(RequestId),
    Search(SearchParams),
    Compare { dn: String, attr: String, value: Vec<u8> },
    Add { dn: String, attrs: Vec<Attribute> },
    Modify { dn: String, mods: Vec<Mod<Vec<u8>>> },
    ModifyDn {
        dn: String,
        rdn: String,
        delete_old: bool,
        new_superior: Option<String>,
    },
    Delete { dn: String },
    Extended(Exop),
}

impl Request {
    /// The request name used in diagnostics and teardown errors.
    pub fn op_name(&self) -> &'static str {
        match self {
            Request::SimpleBind { .. } | Request::SaslBind { .. } => "BindRequest",
            Request::Unbind => "UnbindRequest",
            Request::Abandon(_) => "AbandonRequest",
            Request::Search(_) => "SearchRequest",
            Request::Compare { .. } => "CompareRequest",
            Request::Add { .. } => "AddRequest",
            Request::Modify { .. } => "ModifyRequest",
            Request::ModifyDn { .. } => "ModifyDNRequest",
            Request::Delete { .. } => "DelRequest",
            Request::Extended(_) => "ExtendedRequest",
        }
    }

    /// Serialize the protocol-op body, tagged with the application-class
    /// tag of the operation.
    pub fn into_tag(self) -> Tag {
        fn octets(inner: Vec<u8>) -> Tag {
            Tag::OctetString(OctetString {
                inner,
                ..Default::default()
            })
        }

        match self {
            Request::SimpleBind { dn, password } => Tag::Sequence(Sequence {
                id: 0,
                class: TagClass::Application,
                inner: vec![
                    Tag::Integer(Integer {
                        inner: 3,
                        ..Default::default()
                    }),
                    octets(dn.into_bytes()),
                    Tag::OctetString(OctetString {
                        id: 0,
                        class: TagClass::Context,
                        inner: password.into_bytes(),
                    }),
                ],
            }),
            Request::SaslBind {
                mechanism,
                credentials,
            } => {
                let mut creds = vec![octets(mechanism.into_bytes())];
                if let Some(credentials) = credentials {
                    creds.push(octets(credentials));
                }
                Tag::Sequence(Sequence {
                    id: 0,
                    class: TagClass::Application,
                    inner: vec![
                        Tag::Integer(Integer {
                            inner: 3,
                            ..Default::default()
                        }),
                        octets(Vec::new()),
                        Tag::Sequence(Sequence {
                            id: 3,
                            class: TagClass::Context,
                            inner: creds,
                        }),
                    ],
                })
            }
            Request::Unbind => Tag::Null(Null {
                id: 2,
                class: TagClass::Application,
                inner: (),
            }),
            Request::Abandon(msgid) => Tag::Integer(Integer {
                id: 16,
                class: TagClass::Application,
                inner: msgid as i64,
            }),
            Request::Search(params) => Tag::Sequence(Sequence {
                id: 3,
                class: TagClass::Application,
                inner: vec![
                    octets(params.base.into_bytes()),
                    Tag::Enumerated(Enumerated {
                        inner: params.scope as i64,
                        ..Default::default()
                    }),
                    Tag::Enumerated(Enumerated {
                        inner: params.deref as i64,
                        ..Default::default()
                    }),
                    Tag::Integer(Integer {
                        inner: params.sizelimit as i64,
                        ..Default::default()
                    }),
                    Tag::Integer(Integer {
                        inner: params.timelimit as i64,
                        ..Default::default()
                    }),
                    Tag::Boolean(Boolean {
                        inner: params.typesonly,
                        ..Default::default()
                    }),
                    params.filter.into_tag(),
                    Tag::Sequence(Sequence {
                        inner: params
                            .attrs
                            .into_iter()
                            .map(|s| octets(s.into_bytes()))
                            .collect(),
                        ..Default::default()
                    }),
                ],
            }),
            Request::Compare { dn, attr, value } => Tag::Sequence(Sequence {
                id: 14,
                class: TagClass::Application,
                inner: vec![
                    octets(dn.into_bytes()),
                    Tag::Sequence(Sequence {
                        inner: vec![octets(attr.into_bytes()), octets(value)],
                        ..Default::default()
                    }),
                ],
            }),
            Request::Add { dn, attrs } => Tag::Sequence(Sequence {
                id: 8,
                class: TagClass::Application,
                inner: vec![
                    octets(dn.into_bytes()),
                    Tag::Sequence(Sequence {
                        inner: attrs.into_iter().map(Attribute::into_tag).collect(),
                        ..Default::default()
                    }),
                ],
            }),
            Request::Modify { dn, mods } => Tag::Sequence(Sequence {
                id: 6,
                class: TagClass::Application,
                inner: vec![
                    octets(dn.into_bytes()),
                    Tag::Sequence(Sequence {
                        inner: mods.into_iter().map(mod_tag).collect(),
                        ..Default::default()
                    }),
                ],
            }),
            Request::ModifyDn {
                dn,
                rdn,
                delete_old,
                new_superior,
            } => {
                let mut params = vec![
                    octets(dn.into_bytes()),
                    octets(rdn.into_bytes()),
                    Tag::Boolean(Boolean {
                        inner: delete_old,
                        ..Default::default()
                    }),
                ];
                if let Some(new_superior) = new_superior {
                    params.push(Tag::OctetString(OctetString {
                        id: 0,
                        class: TagClass::Context,
                        inner: new_superior.into_bytes(),
                    }));
                }
                Tag::Sequence(Sequence {
                    id: 12,
                    class: TagClass::Application,
                    inner: params,
                })
            }
            Request::Delete { dn } => Tag::OctetString(OctetString {
                id: 10,
                class: TagClass::Application,
                inner: dn.into_bytes(),
            }),
            Request::Extended(exop) => Tag::Sequence(Sequence {
                id: 23,
                class: TagClass::Application,
                inner: construct_exop(exop),
            }),
        }
    }
}

fn mod_tag(m: Mod<Vec<u8>>) -> Tag {
    let (num, attr, values) = match m {
        Mod::Add(attr, set) => (0, attr, set.into_iter().collect::<Vec<_>>()),
        Mod::Delete(attr, set) => (1, attr, set.into_iter().collect()),
        Mod::Replace(attr, set) => (2, attr, set.into_iter().collect()),
        Mod::Increment(attr, val) => (3, attr, vec![val]),
    };
    let op = Tag::Enumerated(Enumerated {
        inner: num,
        ..Default::default()
    });
    let part_attr = Tag::Sequence(Sequence {
        inner: vec![
            Tag::OctetString(OctetString {
                inner: attr,
                ..Default::default()
            }),
            Tag::Set(Set {
                inner: values
                    .into_iter()
                    .map(|val| {
                        Tag::OctetString(OctetString {
                            inner: val,
                            ..Default::default()
                        })
                    })
                    .collect(),
                ..Default::default()
            }),
        ],
        ..Default::default()
    });
    Tag::Sequence(Sequence {
        inner: vec![op, part_attr],
        ..Default::default()
    })
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            // the password never reaches log output
            Request::SimpleBind { dn, .. } => f
                .debug_struct("SimpleBind")
                .field("dn", dn)
                .field("password", &"<redacted>")
                .finish(),
            Request::SaslBind { mechanism, .. } => f
                .debug_struct("SaslBind")
                .field("mechanism", mechanism)
                .field("credentials", &"<redacted>")
                .finish(),
            other => f.write_str(other.op_name()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::Request;
    use crate::protocol::LdapCodec;

    use bytes::BytesMut;
    use tokio_util::codec::Encoder;

    fn encode(id: i32, req: Request) -> Vec<u8> {
        let mut codec = LdapCodec;
        let mut buf = BytesMut::new();
        codec.encode((id, req.into_tag(), None), &mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn bind_envelope_bytes() {
        let bytes = encode(
            1,
            Request::SimpleBind {
                dn: "cn=root,dc=plabs".to_string(),
                password: "asdf".to_string(),
            },
        );
        let expected = vec![
            0x30, 0x20, 0x02, 0x01, 0x01, 0x60, 0x1B, 0x02, 0x01, 0x03, 0x04, 0x10, 0x63, 0x6e,
            0x3d, 0x72, 0x6f, 0x6f, 0x74, 0x2c, 0x64, 0x63, 0x3d, 0x70, 0x6c, 0x61, 0x62, 0x73,
            0x80, 0x04, 0x61, 0x73, 0x64, 0x66,
        ];
        assert_eq!(bytes, expected);
    }

    #[test]
    fn sasl_bind_body() {
        let bytes = encode(
            2,
            Request::SaslBind {
                mechanism: "EXTERNAL".to_string(),
                credentials: Some(Vec::new()),
            },
        );
        // application 0, version 3, empty name, [3] { "EXTERNAL", "" }
        let expected = vec![
            0x30, 0x18, 0x02, 0x01, 0x02, 0x60, 0x13, 0x02, 0x01, 0x03, 0x04, 0x00, 0xa3, 0x0c,
            0x04, 0x08, 0x45, 0x58, 0x54, 0x45, 0x52, 0x4e, 0x41, 0x4c, 0x04, 0x00,
        ];
        assert_eq!(bytes, expected);
    }

    #[test]
    fn unbind_is_empty_null() {
        let bytes = encode(3, Request::Unbind);
        assert_eq!(bytes, vec![0x30, 0x05, 0x02, 0x01, 0x03, 0x42, 0x00]);
    }

    #[test]
    fn abandon_carries_target_id() {
        let bytes = encode(4, Request::Abandon(2));
        assert_eq!(bytes, vec![0x30, 0x06, 0x02, 0x01, 0x04, 0x50, 0x01, 0x02]);
    }

    #[test]
    fn delete_is_octet_string() {
        let bytes = encode(
            5,
            Request::Delete {
                dn: "dc=x".to_string(),
            },
        );
        assert_eq!(
            bytes,
            vec![0x30, 0x09, 0x02, 0x01, 0x05, 0x4a, 0x04, 0x64, 0x63, 0x3d, 0x78]
        );
    }

    #[test]
    fn debug_redacts_password() {
        let req = Request::SimpleBind {
            dn: "cn=x".to_string(),
            password: "hunter2".to_string(),
        };
        let dbg = format!("{:?}", req);
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("<redacted>"));
    }
}
