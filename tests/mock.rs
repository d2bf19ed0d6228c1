//! Integration tests against a scripted in-process LDAP server.

use std::collections::HashSet;

use ldapmux::{drive, LdapConnAsync, LdapError, Scope, SearchEntry, SearchOptions};

mod support {
    use bytes::BytesMut;
    use lber::common::TagClass;
    use lber::parse::{parse_tag, parse_uint};
    use lber::structure::{StructureTag, PL};
    use lber::structures::{ASNTag, Enumerated, Integer, OctetString, Sequence, Set, Tag};
    use lber::write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    pub const PAGED_OID: &str = "1.2.840.113556.1.4.319";

    pub struct MockServer {
        listener: TcpListener,
        pub url: String,
    }

    impl MockServer {
        pub async fn start() -> MockServer {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("ldap://127.0.0.1:{}", listener.local_addr().unwrap().port());
            MockServer { listener, url }
        }

        pub async fn accept(&self) -> MockConn {
            let (stream, _) = self.listener.accept().await.unwrap();
            MockConn {
                stream,
                buf: BytesMut::new(),
            }
        }
    }

    pub struct MockConn {
        stream: TcpStream,
        buf: BytesMut,
    }

    pub struct RecvMsg {
        pub id: i32,
        pub op: StructureTag,
        pub controls: Option<StructureTag>,
    }

    impl MockConn {
        /// Read one LDAPMessage envelope, or None on client EOF.
        pub async fn recv(&mut self) -> Option<RecvMsg> {
            loop {
                if !self.buf.is_empty() {
                    let parsed = match parse_tag(&self.buf) {
                        Ok((rest, tag)) => Some((self.buf.len() - rest.len(), tag)),
                        Err(e) if e.is_incomplete() => None,
                        Err(e) => panic!("bad frame from client: {:?}", e),
                    };
                    if let Some((consumed, tag)) = parsed {
                        let _ = self.buf.split_to(consumed);
                        let mut parts = tag
                            .expect_constructed()
                            .expect("envelope")
                            .into_iter();
                        let id = parse_uint(
                            parts
                                .next()
                                .expect("msgid")
                                .expect_primitive()
                                .expect("msgid bytes")
                                .as_slice(),
                        )
                        .expect("msgid uint")
                        .1 as i32;
                        let op = parts.next().expect("protocol op");
                        let controls = parts.next();
                        return Some(RecvMsg { id, op, controls });
                    }
                }
                let mut chunk = [0u8; 4096];
                let n = self.stream.read(&mut chunk).await.unwrap();
                if n == 0 {
                    return None;
                }
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }

        pub async fn send(&mut self, tag: Tag) {
            let mut buf = BytesMut::new();
            write::encode_into(&mut buf, tag.into_structure()).unwrap();
            self.stream.write_all(&buf).await.unwrap();
        }
    }

    /// An LDAPResult-shaped response under the given application tag.
    pub fn result_msg(id: i32, op_id: u64, rc: u32) -> Tag {
        result_msg_ctrls(id, op_id, rc, None)
    }

    pub fn result_msg_ctrls(
        id: i32,
        op_id: u64,
        rc: u32,
        ctrls: Option<Vec<StructureTag>>,
    ) -> Tag {
        let mut inner = vec![
            Tag::Integer(Integer {
                inner: id as i64,
                ..Default::default()
            }),
            Tag::Sequence(Sequence {
                id: op_id,
                class: TagClass::Application,
                inner: vec![
                    Tag::Enumerated(Enumerated {
                        inner: rc as i64,
                        ..Default::default()
                    }),
                    Tag::OctetString(OctetString {
                        inner: vec![],
                        ..Default::default()
                    }),
                    Tag::OctetString(OctetString {
                        inner: vec![],
                        ..Default::default()
                    }),
                ],
            }),
        ];
        if let Some(ctrls) = ctrls {
            inner.push(Tag::StructureTag(StructureTag {
                class: TagClass::Context,
                id: 0,
                payload: PL::C(ctrls),
            }));
        }
        Tag::Sequence(Sequence {
            inner,
            ..Default::default()
        })
    }

    pub fn search_entry(id: i32, dn: &str, attrs: &[(&str, &[&str])]) -> Tag {
        Tag::Sequence(Sequence {
            inner: vec![
                Tag::Integer(Integer {
                    inner: id as i64,
                    ..Default::default()
                }),
                Tag::Sequence(Sequence {
                    id: 4,
                    class: TagClass::Application,
                    inner: vec![
                        Tag::OctetString(OctetString {
                            inner: dn.as_bytes().to_vec(),
                            ..Default::default()
                        }),
                        Tag::Sequence(Sequence {
                            inner: attrs
                                .iter()
                                .map(|(name, vals)| {
                                    Tag::Sequence(Sequence {
                                        inner: vec![
                                            Tag::OctetString(OctetString {
                                                inner: name.as_bytes().to_vec(),
                                                ..Default::default()
                                            }),
                                            Tag::Set(Set {
                                                inner: vals
                                                    .iter()
                                                    .map(|v| {
                                                        Tag::OctetString(OctetString {
                                                            inner: v.as_bytes().to_vec(),
                                                            ..Default::default()
                                                        })
                                                    })
                                                    .collect(),
                                                ..Default::default()
                                            }),
                                        ],
                                        ..Default::default()
                                    })
                                })
                                .collect(),
                            ..Default::default()
                        }),
                    ],
                }),
            ],
            ..Default::default()
        })
    }

    /// A Paged-Results response control carrying the given cookie.
    pub fn paged_control(size: i32, cookie: &[u8]) -> StructureTag {
        let val = Tag::Sequence(Sequence {
            inner: vec![
                Tag::Integer(Integer {
                    inner: size as i64,
                    ..Default::default()
                }),
                Tag::OctetString(OctetString {
                    inner: cookie.to_vec(),
                    ..Default::default()
                }),
            ],
            ..Default::default()
        })
        .into_structure();
        let mut buf = BytesMut::new();
        write::encode_into(&mut buf, val).unwrap();
        Tag::Sequence(Sequence {
            inner: vec![
                Tag::OctetString(OctetString {
                    inner: PAGED_OID.as_bytes().to_vec(),
                    ..Default::default()
                }),
                Tag::OctetString(OctetString {
                    inner: buf.to_vec(),
                    ..Default::default()
                }),
            ],
            ..Default::default()
        })
        .into_structure()
    }

    /// Extract the Paged-Results cookie from a request's controls.
    pub fn paged_cookie(controls: &Option<StructureTag>) -> Option<Vec<u8>> {
        let ctrls = controls.clone()?.expect_constructed()?;
        for ctrl in ctrls {
            let mut parts = ctrl.expect_constructed().expect("control").into_iter();
            let oid = String::from_utf8(
                parts
                    .next()
                    .expect("oid")
                    .expect_primitive()
                    .expect("oid bytes"),
            )
            .expect("oid utf8");
            if oid != PAGED_OID {
                continue;
            }
            let mut val = None;
            for p in parts {
                if p.id == 4 {
                    val = Some(p.expect_primitive().expect("control value"));
                }
            }
            let val = val.expect("paged control without value");
            let (_, tag) = parse_tag(&val).expect("control value BER");
            let mut inner = tag.expect_constructed().expect("paged value").into_iter();
            let _size = inner.next();
            return Some(
                inner
                    .next()
                    .expect("cookie")
                    .expect_primitive()
                    .expect("cookie bytes"),
            );
        }
        None
    }
}

use support::*;

#[tokio::test]
async fn simple_bind_success() {
    let server = MockServer::start().await;
    let url = server.url.clone();
    let mock = tokio::spawn(async move {
        let mut conn = server.accept().await;
        let msg = conn.recv().await.unwrap();
        // the first message ID on a connection is 2
        assert_eq!(msg.id, 2);
        assert_eq!(msg.op.id, 0);
        let mut parts = msg.op.expect_constructed().unwrap().into_iter();
        let _version = parts.next().unwrap();
        let dn = parts.next().unwrap().expect_primitive().unwrap();
        assert_eq!(dn, b"cn=admin,dc=example,dc=com");
        let auth = parts.next().unwrap();
        assert_eq!(auth.id, 0); // [0] simple
        conn.send(result_msg(msg.id, 1, 0)).await;
        conn
    });
    let (conn, mut ldap) = LdapConnAsync::new(&url).await.unwrap();
    drive!(conn);
    let res = ldap
        .simple_bind("cn=admin,dc=example,dc=com", "pw")
        .await
        .unwrap();
    res.success().unwrap();
    mock.await.unwrap();
}

#[tokio::test]
async fn bind_dispatches_on_principal() {
    let server = MockServer::start().await;
    let url = server.url.clone();
    let mock = tokio::spawn(async move {
        let mut conn = server.accept().await;
        // first bind: SASL PLAIN
        let msg = conn.recv().await.unwrap();
        let mut parts = msg.op.expect_constructed().unwrap().into_iter();
        let _version = parts.next().unwrap();
        let dn = parts.next().unwrap().expect_primitive().unwrap();
        assert!(dn.is_empty());
        let auth = parts.next().unwrap();
        assert_eq!(auth.id, 3); // [3] SaslCredentials
        let mut sasl = auth.expect_constructed().unwrap().into_iter();
        let mech = sasl.next().unwrap().expect_primitive().unwrap();
        assert_eq!(mech, b"PLAIN");
        conn.send(result_msg(msg.id, 1, 0)).await;
        // second bind: simple
        let msg = conn.recv().await.unwrap();
        let mut parts = msg.op.expect_constructed().unwrap().into_iter();
        let _version = parts.next().unwrap();
        let dn = parts.next().unwrap().expect_primitive().unwrap();
        assert_eq!(dn, b"cn=x,dc=y");
        let auth = parts.next().unwrap();
        assert_eq!(auth.id, 0);
        conn.send(result_msg(msg.id, 1, 0)).await;
        conn
    });
    let (conn, mut ldap) = LdapConnAsync::new(&url).await.unwrap();
    drive!(conn);
    ldap.bind("PLAIN", "secret").await.unwrap().success().unwrap();
    ldap.bind("cn=x,dc=y", "secret").await.unwrap().success().unwrap();
    mock.await.unwrap();
}

#[tokio::test]
async fn paged_search_follows_cookie() {
    let server = MockServer::start().await;
    let url = server.url.clone();
    let mock = tokio::spawn(async move {
        let mut conn = server.accept().await;
        // first page
        let m1 = conn.recv().await.unwrap();
        assert_eq!(m1.op.id, 3);
        let cookie = paged_cookie(&m1.controls).expect("paged control on request");
        assert!(cookie.is_empty());
        conn.send(search_entry(m1.id, "cn=a,dc=x", &[("cn", &["a"])]))
            .await;
        conn.send(search_entry(m1.id, "cn=b,dc=x", &[("cn", &["b"])]))
            .await;
        conn.send(result_msg_ctrls(
            m1.id,
            5,
            0,
            Some(vec![paged_control(0, b"abc")]),
        ))
        .await;
        // second page, requested with the server's cookie on a fresh ID
        let m2 = conn.recv().await.unwrap();
        assert_eq!(m2.op.id, 3);
        assert!(m2.id > m1.id);
        let cookie = paged_cookie(&m2.controls).expect("paged control on request");
        assert_eq!(cookie, b"abc");
        conn.send(search_entry(m2.id, "cn=c,dc=x", &[("cn", &["c"])]))
            .await;
        conn.send(result_msg_ctrls(
            m2.id,
            5,
            0,
            Some(vec![paged_control(0, b"")]),
        ))
        .await;
        (m1.id, m2.id)
    });
    let (conn, mut ldap) = LdapConnAsync::new(&url).await.unwrap();
    drive!(conn);
    let (entries, res) = ldap
        .with_search_options(SearchOptions::new().paged(true).page_size(2))
        .search("dc=x", Scope::Subtree, "(objectClass=*)", vec!["cn"])
        .await
        .unwrap()
        .success()
        .unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(res.rc, 0);
    let dns = entries
        .into_iter()
        .map(|e| SearchEntry::construct(e).dn)
        .collect::<Vec<_>>();
    assert_eq!(dns, vec!["cn=a,dc=x", "cn=b,dc=x", "cn=c,dc=x"]);
    let (id1, id2) = mock.await.unwrap();
    assert_eq!(id1, 2);
    assert_eq!(id2, 3);
}

#[tokio::test]
async fn caller_supplied_paged_control_is_rejected() {
    use ldapmux::controls::PagedResults;

    let server = MockServer::start().await;
    let url = server.url.clone();
    let (conn, mut ldap) = LdapConnAsync::new(&url).await.unwrap();
    drive!(conn);
    let res = ldap
        .with_controls(PagedResults {
            size: 10,
            cookie: vec![],
        })
        .with_search_options(SearchOptions::new().paged(true))
        .search("dc=x", Scope::Subtree, "(objectClass=*)", vec!["cn"])
        .await;
    assert!(matches!(res, Err(LdapError::PagedControlConflict)));
}

#[tokio::test]
async fn size_limited_search_tolerates_size_limit_exceeded() {
    let server = MockServer::start().await;
    let url = server.url.clone();
    let mock = tokio::spawn(async move {
        let mut conn = server.accept().await;
        let msg = conn.recv().await.unwrap();
        assert_eq!(msg.op.id, 3);
        conn.send(search_entry(msg.id, "cn=a,dc=x", &[("cn", &["a"])]))
            .await;
        conn.send(search_entry(msg.id, "cn=b,dc=x", &[("cn", &["b"])]))
            .await;
        conn.send(result_msg(msg.id, 5, 4)).await; // sizeLimitExceeded
        conn
    });
    let (conn, mut ldap) = LdapConnAsync::new(&url).await.unwrap();
    drive!(conn);
    let (entries, _res) = ldap
        .with_search_options(SearchOptions::new().sizelimit(2))
        .search("dc=x", Scope::Subtree, "(objectClass=*)", vec!["cn"])
        .await
        .unwrap()
        .success()
        .unwrap();
    assert_eq!(entries.len(), 2);
    mock.await.unwrap();
}

#[tokio::test]
async fn search_collects_references() {
    let server = MockServer::start().await;
    let url = server.url.clone();
    let mock = tokio::spawn(async move {
        let mut conn = server.accept().await;
        let msg = conn.recv().await.unwrap();
        conn.send(search_entry(msg.id, "cn=a,dc=x", &[("cn", &["a"])]))
            .await;
        // SearchResultReference: [19] SEQUENCE OF URI
        conn.send(lber::structures::Tag::Sequence(lber::structures::Sequence {
            inner: vec![
                lber::structures::Tag::Integer(lber::structures::Integer {
                    inner: msg.id as i64,
                    ..Default::default()
                }),
                lber::structures::Tag::Sequence(lber::structures::Sequence {
                    id: 19,
                    class: lber::common::TagClass::Application,
                    inner: vec![lber::structures::Tag::OctetString(
                        lber::structures::OctetString {
                            inner: b"ldap://other.example/dc=x".to_vec(),
                            ..Default::default()
                        },
                    )],
                }),
            ],
            ..Default::default()
        }))
        .await;
        conn.send(result_msg(msg.id, 5, 0)).await;
        conn
    });
    let (conn, mut ldap) = LdapConnAsync::new(&url).await.unwrap();
    drive!(conn);
    let (entries, res) = ldap
        .search("dc=x", Scope::Subtree, "(objectClass=*)", vec!["cn"])
        .await
        .unwrap()
        .success()
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(res.refs, vec!["ldap://other.example/dc=x"]);
    mock.await.unwrap();
}

#[tokio::test]
async fn socket_close_rejects_in_flight_op_but_resolves_unbind() {
    let server = MockServer::start().await;
    let url = server.url.clone();
    let mock = tokio::spawn(async move {
        let mut conn = server.accept().await;
        let msg = conn.recv().await.unwrap();
        assert_eq!(msg.op.id, 8); // AddRequest, left unanswered
        // drain until the client goes away, then close our end
        while conn.recv().await.is_some() {}
    });
    let (conn, mut ldap) = LdapConnAsync::new(&url).await.unwrap();
    drive!(conn);
    let mut add_handle = ldap.clone();
    let add_task = tokio::spawn(async move {
        add_handle
            .add("cn=x,dc=y", vec![("objectClass", HashSet::from(["top"]))])
            .await
    });
    // give the add a chance to hit the wire first
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    ldap.unbind().await.unwrap();
    let res = add_task.await.unwrap();
    match res {
        Err(e @ LdapError::ConnectionClosed { op }) => {
            assert_eq!(op, "AddRequest");
            assert!(e.to_string().contains("AddRequest"));
        }
        other => panic!("expected ConnectionClosed, got {:?}", other),
    }
    mock.await.unwrap();
}

#[tokio::test]
async fn request_timeout_tears_down_socket() {
    let server = MockServer::start().await;
    let url = server.url.clone();
    let mock = tokio::spawn(async move {
        let mut conn = server.accept().await;
        let msg = conn.recv().await.unwrap();
        assert_eq!(msg.op.id, 3);
        // stay silent; the client must end the socket on its own
        assert!(conn.recv().await.is_none());
    });
    let (conn, mut ldap) = LdapConnAsync::new(&url).await.unwrap();
    drive!(conn);
    let res = ldap
        .with_timeout(std::time::Duration::from_millis(50))
        .search("dc=x", Scope::Subtree, "(objectClass=*)", vec!["cn"])
        .await;
    assert!(matches!(res, Err(LdapError::Timeout { .. })));
    mock.await.unwrap();
}

#[tokio::test]
async fn refused_starttls_leaves_pending_search_alive() {
    let server = MockServer::start().await;
    let url = server.url.clone();
    let mock = tokio::spawn(async move {
        let mut conn = server.accept().await;
        let search = conn.recv().await.unwrap();
        assert_eq!(search.op.id, 3);
        let exop = conn.recv().await.unwrap();
        assert_eq!(exop.op.id, 23);
        // an entry for the pending search arrives before the exop answer
        conn.send(search_entry(search.id, "cn=a,dc=x", &[("cn", &["a"])]))
            .await;
        conn.send(result_msg(exop.id, 24, 52)).await; // unavailable
        conn.send(result_msg(search.id, 5, 0)).await;
        conn
    });
    let (conn, mut ldap) = LdapConnAsync::new(&url).await.unwrap();
    drive!(conn);
    let mut stream = ldap
        .streaming_search("dc=x", Scope::Subtree, "(objectClass=*)", vec!["cn"])
        .await
        .unwrap();
    let err = ldap.starttls(None).await.unwrap_err();
    assert!(matches!(
        err,
        LdapError::LdapResult { result } if result.rc == 52
    ));
    let entry = stream.next().await.unwrap().expect("entry survives");
    assert_eq!(SearchEntry::construct(entry).dn, "cn=a,dc=x");
    assert!(stream.next().await.unwrap().is_none());
    assert_eq!(stream.finish().await.rc, 0);
    mock.await.unwrap();
}

#[tokio::test]
async fn abandon_resolves_without_response() {
    let server = MockServer::start().await;
    let url = server.url.clone();
    let mock = tokio::spawn(async move {
        let mut conn = server.accept().await;
        let search = conn.recv().await.unwrap();
        assert_eq!(search.op.id, 3);
        let abandon = conn.recv().await.unwrap();
        assert_eq!(abandon.op.id, 16);
        (search.id, abandon.id)
    });
    let (conn, mut ldap) = LdapConnAsync::new(&url).await.unwrap();
    drive!(conn);
    let mut stream = ldap
        .streaming_search("dc=x", Scope::Subtree, "(objectClass=*)", vec!["cn"])
        .await
        .unwrap();
    let target = stream.ldap_handle().last_id();
    ldap.abandon(target).await.unwrap();
    let (search_id, _) = mock.await.unwrap();
    assert_eq!(search_id, target);
}

#[tokio::test]
async fn connect_timeout_applies() {
    use ldapmux::LdapConnSettings;

    // RFC 5737 TEST-NET address; the handshake either hangs until the
    // timeout fires or is refused outright, but never completes
    let res = LdapConnAsync::with_settings(
        LdapConnSettings::new().set_conn_timeout(std::time::Duration::from_millis(100)),
        "ldap://192.0.2.1:389",
    )
    .await;
    assert!(res.is_err());
}
