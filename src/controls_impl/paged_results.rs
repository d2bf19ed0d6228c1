use bytes::BytesMut;

use lber::common::TagClass;
use lber::parse::{parse_tag, parse_uint};
use lber::structures::{ASNTag, Integer, OctetString, Sequence, Tag};
use lber::universal::Types;
use lber::write;

use super::{ControlParser, MakeCritical, RawControl};

pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";

/// Paged Results control ([RFC 2696](https://tools.ietf.org/html/rfc2696)).
///
/// The same structure is used for requests and responses. In a request,
/// `size` asks the server for a page of at most that many entries, and
/// `cookie` must replay the cookie from the previous response, or be empty
/// on the first request. A response carries the server's continuation
/// cookie; an empty cookie means the result set is exhausted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PagedResults {
    /// Requested page size, or the server's result set size estimate.
    pub size: i32,
    /// Opaque continuation cookie.
    pub cookie: Vec<u8>,
}

impl MakeCritical for PagedResults {}

impl From<PagedResults> for RawControl {
    fn from(pr: PagedResults) -> RawControl {
        let cookie = pr.cookie;
        let pr_vec = vec![
            Tag::Integer(Integer {
                inner: pr.size as i64,
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                inner: cookie,
                ..Default::default()
            }),
        ];
        let pr_val = Tag::Sequence(Sequence {
            inner: pr_vec,
            ..Default::default()
        })
        .into_structure();
        let mut buf = BytesMut::new();
        write::encode_into(&mut buf, pr_val).expect("encoded");
        RawControl {
            ctype: PAGED_RESULTS_OID.to_owned(),
            crit: false,
            val: Some(Vec::from(&buf[..])),
        }
    }
}

impl ControlParser for PagedResults {
    fn parse(val: &[u8]) -> PagedResults {
        let mut pr_comps = match parse_tag(val) {
            Ok((_, tag)) => tag,
            _ => panic!("failed to parse paged results value components"),
        }
        .expect_constructed()
        .expect("paged results components")
        .into_iter();
        let size = match parse_uint(
            pr_comps
                .next()
                .expect("element")
                .match_class(TagClass::Universal)
                .and_then(|t| t.match_id(Types::Integer as u64))
                .and_then(|t| t.expect_primitive())
                .expect("paged results size")
                .as_slice(),
        ) {
            Ok((_, size)) => size as i32,
            _ => panic!("failed to parse size"),
        };
        let cookie = pr_comps
            .next()
            .expect("element")
            .expect_primitive()
            .expect("octet string");
        PagedResults { size, cookie }
    }
}
