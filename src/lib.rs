//! A pure-Rust LDAPv3 client protocol engine using the Tokio stack.
//!
//! ## Summary
//!
//! The library multiplexes any number of LDAP operations over a single
//! connection to a directory server. Opening a connection with
//! [`LdapConnAsync::new()`](struct.LdapConnAsync.html#method.new) yields the
//! connection itself, which must be spawned on the active Tokio executor,
//! and an [`Ldap`](struct.Ldap.html) handle used to perform operations:
//! Bind (simple and SASL `PLAIN`/`EXTERNAL`), Search with optional
//! Paged-Results driving, Add, Compare, Delete, Modify, ModifyDN, Extended
//! operations, StartTLS, Abandon, and Unbind.
//!
//! The documentation is written for readers familiar with LDAP concepts and
//! terminology, which it won't attempt to explain.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ldapmux::{LdapConnAsync, Scope, SearchEntry};
//! use ldapmux::result::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let (conn, mut ldap) = LdapConnAsync::new("ldap://localhost:2389").await?;
//!     ldapmux::drive!(conn);
//!     ldap.simple_bind("cn=admin,dc=example,dc=org", "secret").await?.success()?;
//!     let (rs, _res) = ldap.search(
//!         "ou=Places,dc=example,dc=org",
//!         Scope::Subtree,
//!         "(&(objectClass=locality)(l=ma*))",
//!         vec!["l"]
//!     ).await?.success()?;
//!     for entry in rs {
//!         println!("{:?}", SearchEntry::construct(entry));
//!     }
//!     Ok(ldap.unbind().await?)
//! }
//! ```

#[doc(hidden)]
#[macro_use]
pub extern crate log;
#[doc(hidden)]
pub use tokio;

/// Type alias for the LDAP message ID.
pub type RequestId = i32;

mod attribute;
mod conn;
pub mod controls {
    //! Control construction and parsing.
    //!
    //! A control can be associated with a request or a response. The
    //! [`PagedResults`](struct.PagedResults.html) control is implemented
    //! directly by this library; a third-party control must implement the
    //! conversion from an instance of itself to
    //! [`RawControl`](struct.RawControl.html), a general form of control.
    //!
    //! `RawControl`, together with an optional instance of
    //! [`ControlType`](enum.ControlType.html), forms the type
    //! [`Control`](struct.Control.html); a vector of `Control`s is part of
    //! the result of all LDAP operations which return one. A recognized
    //! response control can be parsed by calling
    //! [`parse()`](struct.RawControl.html#method.parse) on the instance of
    //! `RawControl` representing it, if a
    //! [`ControlParser`](trait.ControlParser.html) implementation exists
    //! for the specified type.
    pub use crate::controls_impl::{PagedResults, PAGED_RESULTS_OID};
    pub use crate::controls_impl::{
        Control, ControlParser, ControlType, CriticalControl, IntoRawControlVec, MakeCritical,
        RawControl,
    };
}
mod controls_impl;
pub mod dn;
mod exop_impl;
pub mod exop {
    //! Extended operation construction and parsing.
    //!
    //! A generic exop is represented by [`Exop`](struct.Exop.html). If a
    //! particular exop is implemented by this library, it has a request
    //! struct implementing the `From` conversion of itself into `Exop`,
    //! and, when the response carries data, a response struct
    //! implementing the [`ExopParser`](trait.ExopParser.html) trait.
    pub use crate::exop_impl::{
        Exop, ExopParser, StartTLS, WhoAmI, WhoAmIResp, STARTTLS_OID, WHOAMI_OID,
    };
}
mod filter;
mod ldap;
mod messages;
mod protocol;
pub mod result;
mod search;
mod util;

pub use attribute::Attribute;
pub use conn::{LdapConnAsync, LdapConnSettings};
pub use dn::{Dn, Rdn};
pub use filter::Filter;
pub use ldap::{Ldap, Mod};
pub use result::{LdapError, LdapResult, SearchResult};
pub use search::parse_refs;
pub use search::{
    DerefAliases, ResultEntry, Scope, SearchEntry, SearchOptions, SearchStream, StreamState,
};
pub use util::{dn_escape, ldap_escape, ldap_unescape};
