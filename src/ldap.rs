use std::collections::HashSet;
use std::hash::Hash;
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::attribute::Attribute;
use crate::controls_impl::IntoRawControlVec;
use crate::controls::{Control, ControlType, PagedResults, RawControl, PAGED_RESULTS_OID};
use crate::dn::{split_first_unescaped_comma, Dn};
use crate::exop::Exop;
use crate::filter::Filter;
use crate::messages::Request;
use crate::protocol::{alloc_msgid, LdapOp, MaybeControls, MiscCommand, PendingOp};
use crate::result::{
    CompareResult, ExopResult, LdapError, LdapResult, LdapResultExt, Result, SearchResult,
};
use crate::search::{parse_refs, Scope, SearchOptions, SearchStream};
use crate::RequestId;

use native_tls::TlsConnector;
use tokio::sync::{mpsc, oneshot};
use tokio::time;

/// Possible sub-operations for the Modify operation.
#[derive(Clone, Debug, PartialEq)]
pub enum Mod<S: AsRef<[u8]> + Eq + Hash> {
    /// Add an attribute, with at least one value.
    Add(S, HashSet<S>),
    /// Delete the entire attribute, or the given values of an attribute.
    Delete(S, HashSet<S>),
    /// Replace an existing attribute, setting its values to those in the set, or delete it if no values are given.
    Replace(S, HashSet<S>),
    /// Increment the attribute by the given value.
    Increment(S, S),
}

impl<S: AsRef<[u8]> + Eq + Hash> Mod<S> {
    fn into_bytes(self) -> Mod<Vec<u8>> {
        fn conv<S: AsRef<[u8]> + Eq + Hash>(set: HashSet<S>) -> HashSet<Vec<u8>> {
            set.into_iter().map(|v| v.as_ref().to_vec()).collect()
        }
        match self {
            Mod::Add(attr, set) => Mod::Add(attr.as_ref().to_vec(), conv(set)),
            Mod::Delete(attr, set) => Mod::Delete(attr.as_ref().to_vec(), conv(set)),
            Mod::Replace(attr, set) => Mod::Replace(attr.as_ref().to_vec(), conv(set)),
            Mod::Increment(attr, val) => {
                Mod::Increment(attr.as_ref().to_vec(), val.as_ref().to_vec())
            }
        }
    }
}

/// Asynchronous handle for LDAP operations. __*__
///
/// All LDAP operations allow attaching a series of request controls, which augment or modify
/// the operation. Controls are attached by calling [`with_controls()`](#method.with_controls)
/// on the handle, and using the result to call another modifier or the operation itself.
/// A timeout can be imposed on an operation by calling [`with_timeout()`](#method.with_timeout)
/// on the handle before invoking the operation.
///
/// The Search operation has many parameters, most of which are infrequently used. Those
/// parameters can be specified by constructing a [`SearchOptions`](struct.SearchOptions.html)
/// structure and passing it to [`with_search_options()`](#method.with_search_options)
/// called on the handle. This method can be combined with `with_controls()` and `with_timeout()`,
/// described above.
///
/// As a rule, operations return [`LdapResult`](result/struct.LdapResult.html),
/// a structure of result components. The most important element of `LdapResult`
/// is the result code, a numeric value indicating the outcome of the operation.
/// This structure also contains the possibly empty vector of response controls,
/// which are not directly usable, but must be additionally parsed by the driver- or
/// user-supplied code.
///
/// The handle can be freely cloned. Each clone will multiplex the invoked LDAP operations on
/// the same underlying connection.
#[derive(Debug)]
pub struct Ldap {
    pub(crate) msgmap: Arc<Mutex<(RequestId, HashSet<RequestId>)>>,
    pub(crate) tx: mpsc::UnboundedSender<PendingOp>,
    pub(crate) id_scrub_tx: mpsc::UnboundedSender<RequestId>,
    pub(crate) misc_tx: mpsc::UnboundedSender<MiscCommand>,
    pub(crate) last_id: RequestId,
    pub(crate) default_timeout: Option<Duration>,
    pub(crate) strict_dn: bool,
    pub timeout: Option<Duration>,
    pub controls: MaybeControls,
    pub search_opts: Option<SearchOptions>,
}

impl Clone for Ldap {
    fn clone(&self) -> Self {
        Ldap {
            msgmap: self.msgmap.clone(),
            tx: self.tx.clone(),
            id_scrub_tx: self.id_scrub_tx.clone(),
            misc_tx: self.misc_tx.clone(),
            last_id: 0,
            default_timeout: self.default_timeout,
            strict_dn: self.strict_dn,
            timeout: None,
            controls: None,
            search_opts: None,
        }
    }
}

impl Ldap {
    pub(crate) async fn op_call(&mut self, op: LdapOp, req: Request) -> Result<(LdapResult, Exop)> {
        let id = alloc_msgid(&self.msgmap);
        self.last_id = id;
        let op_name = req.op_name();
        let (tx, rx) = oneshot::channel();
        self.tx.send(PendingOp {
            id,
            op,
            tag: req.into_tag(),
            controls: self.controls.take(),
            tx,
            op_name,
        })?;
        let response = if let Some(timeout) = self.timeout.take().or(self.default_timeout) {
            let res = time::timeout(timeout, rx).await;
            if res.is_err() {
                // scrub the ID and end the socket: abandoning the request
                // wouldn't stop the server from sending more data our way
                self.id_scrub_tx.send(self.last_id)?;
                self.misc_tx.send(MiscCommand::EndSocket)?;
            }
            res??
        } else {
            rx.await?
        }?;
        let (ldap_ext, controls) = (LdapResultExt::from(response.0), response.1);
        let (mut result, exop) = (ldap_ext.0, ldap_ext.1);
        result.ctrls = controls;
        Ok((result, exop))
    }

    fn check_dn(&self, dn: &str) -> Result<()> {
        if self.strict_dn {
            Dn::parse(dn)?;
        }
        Ok(())
    }

    /// Use the provided `SearchOptions` with the next Search operation, which can
    /// be invoked directly on the result of this method. If this method is used in
    /// combination with a non-Search operation, the provided options will be silently
    /// discarded when the operation is invoked.
    pub fn with_search_options(&mut self, opts: SearchOptions) -> &mut Self {
        self.search_opts = Some(opts);
        self
    }

    /// Pass the provided request control(s) to the next LDAP operation.
    /// Controls can be constructed by instantiating structs in the
    /// [`controls`](controls/index.html) module, and converted to the form needed
    /// by this method by calling `into()` on the instances.
    ///
    /// This method accepts either a control vector or a single `RawControl`. The
    /// latter is intended to make the call site less noisy, since it's expected
    /// that passing a single control will comprise the majority of uses.
    pub fn with_controls<V: IntoRawControlVec>(&mut self, ctrls: V) -> &mut Self {
        self.controls = Some(ctrls.into());
        self
    }

    /// Perform the next operation with the timeout specified in `duration`.
    /// The LDAP Search operation consists of an indeterminate number of Entry/Referral
    /// replies; the timer is reset for each reply.
    ///
    /// If the timeout occurs, the operation will return an error and the
    /// underlying connection will be shut down, since the server could
    /// otherwise keep streaming results for an operation nobody is
    /// waiting on.
    pub fn with_timeout(&mut self, duration: Duration) -> &mut Self {
        self.timeout = Some(duration);
        self
    }

    /// Do a Bind with `principal` interpreted the way thin directory
    /// clients traditionally do: the values `PLAIN` and `EXTERNAL` select
    /// the SASL mechanism of that name, with `password` passed through as
    /// the credentials; any other value is taken to be a DN for a simple
    /// Bind.
    pub async fn bind(&mut self, principal: &str, password: &str) -> Result<LdapResult> {
        match principal {
            "PLAIN" | "EXTERNAL" => {
                let req = Request::SaslBind {
                    mechanism: String::from(principal),
                    credentials: Some(Vec::from(password.as_bytes())),
                };
                Ok(self.op_call(LdapOp::Single, req).await?.0)
            }
            dn => self.simple_bind(dn, password).await,
        }
    }

    /// Do a simple Bind with the provided DN (`bind_dn`) and password (`bind_pw`).
    pub async fn simple_bind(&mut self, bind_dn: &str, bind_pw: &str) -> Result<LdapResult> {
        self.check_dn(bind_dn)?;
        let req = Request::SimpleBind {
            dn: String::from(bind_dn),
            password: String::from(bind_pw),
        };
        Ok(self.op_call(LdapOp::Single, req).await?.0)
    }

    /// Do an SASL EXTERNAL bind on the connection. The identity of the client
    /// must have already been established by connection-specific methods, as
    /// is the case for TLS client certificates. The bind is made with the
    /// hardcoded empty authzId value.
    pub async fn sasl_external_bind(&mut self) -> Result<LdapResult> {
        let req = Request::SaslBind {
            mechanism: String::from("EXTERNAL"),
            credentials: Some(Vec::new()),
        };
        Ok(self.op_call(LdapOp::Single, req).await?.0)
    }

    /// Do an SASL PLAIN bind ([RFC 4616](https://tools.ietf.org/html/rfc4616))
    /// with the given authentication identity and password, and an empty
    /// authorization identity.
    pub async fn sasl_plain_bind(&mut self, authcid: &str, password: &str) -> Result<LdapResult> {
        let req = Request::SaslBind {
            mechanism: String::from("PLAIN"),
            credentials: Some(format!("\0{}\0{}", authcid, password).into_bytes()),
        };
        Ok(self.op_call(LdapOp::Single, req).await?.0)
    }

    /// Perform a Search with the given base DN (`base`), scope, filter, and
    /// the list of attributes to be returned (`attrs`). If `attrs` is empty,
    /// or if it contains a special name `*` (asterisk), return all (user) attributes.
    /// Requesting a special name `+` (plus sign) will return all operational
    /// attributes. Include both `*` and `+` in order to return all attributes
    /// of an entry.
    ///
    /// The returned structure wraps the vector of result entries and the overall
    /// result of the operation. Entries are not directly usable, and must be parsed by
    /// [`SearchEntry::construct()`](struct.SearchEntry.html#method.construct). All
    /// referrals in the result stream will be collected in the `refs` vector of the
    /// operation result. Any intermediate messages will be discarded.
    ///
    /// When the [`paged`](struct.SearchOptions.html#method.paged) search option is
    /// set, the whole result set is retrieved through the Paged Results control:
    /// pages are requested until the server returns an empty cookie, each page on a
    /// fresh message ID, and the accumulated entries are returned in one batch. A
    /// Paged-Results control supplied through `with_controls()` is rejected, since
    /// the paging loop owns that control.
    ///
    /// A search limited with the [`sizelimit`](struct.SearchOptions.html#method.sizelimit)
    /// option which terminates with the `sizeLimitExceeded` result code resolves
    /// successfully with the entries received, since the truncation was requested
    /// by the caller.
    pub async fn search<S: AsRef<str>, A: AsRef<[S]>>(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: A,
    ) -> Result<SearchResult> {
        let opts = self.search_opts.clone().unwrap_or_default();
        if opts.paged {
            return self.paged_search(base, scope, filter, attrs).await;
        }
        let sizelimit = opts.sizelimit;
        let mut stream = self.streaming_search(base, scope, filter, attrs).await?;
        let mut entries = vec![];
        let mut refs = vec![];
        while let Some(item) = stream.next().await? {
            if item.is_intermediate() {
                continue;
            }
            if item.is_ref() {
                refs.extend(parse_refs(item.0));
            } else {
                entries.push(item);
            }
        }
        let mut res = stream.finish().await;
        res.refs.extend(refs);
        if res.rc == 4 && sizelimit > 0 {
            // the caller asked for a capped result
            res.rc = 0;
        }
        Ok(SearchResult(entries, res))
    }

    /// Perform a Search, but unlike [`search()`](#method.search) (q.v., also for
    /// the parameters), which returns all results at once, return a handle which
    /// will be used for retrieving entries one by one. See [`SearchStream`](struct.SearchStream.html)
    /// for the explanation of the protocol which must be adhered to in this case.
    pub async fn streaming_search<S: AsRef<str>, A: AsRef<[S]>>(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: A,
    ) -> Result<SearchStream> {
        let filter = Filter::parse(filter)?;
        self.check_dn(base)?;
        let attrs = attrs
            .as_ref()
            .iter()
            .map(|s| String::from(s.as_ref()))
            .collect::<Vec<_>>();
        let mut ldap = self.clone();
        ldap.controls = self.controls.take();
        ldap.timeout = self.timeout.take();
        ldap.search_opts = self.search_opts.take();
        let mut stream = SearchStream::new(ldap);
        stream.start(base, scope, filter, attrs).await?;
        Ok(stream)
    }

    async fn paged_search<S: AsRef<str>, A: AsRef<[S]>>(
        &mut self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: A,
    ) -> Result<SearchResult> {
        let base_controls = self.controls.take().unwrap_or_default();
        if base_controls.iter().any(|c| c.ctype == PAGED_RESULTS_OID) {
            return Err(LdapError::PagedControlConflict);
        }
        let mut opts = self.search_opts.take().unwrap_or_default();
        opts.paged = false;
        let timeout = self.timeout.take();
        let filter = Filter::parse(filter)?;
        self.check_dn(base)?;
        let attrs = attrs
            .as_ref()
            .iter()
            .map(|s| String::from(s.as_ref()))
            .collect::<Vec<_>>();
        let page_size = opts.page_size.unwrap_or(if opts.sizelimit > 1 {
            opts.sizelimit - 1
        } else {
            100
        });
        let mut cookie = Vec::new();
        let mut entries = vec![];
        let mut refs: Vec<String> = vec![];
        let mut res = loop {
            let mut controls = base_controls.clone();
            controls.push(RawControl::from(PagedResults {
                size: page_size,
                cookie: mem::take(&mut cookie),
            }));
            let mut ldap = self.clone();
            ldap.controls = Some(controls);
            ldap.timeout = timeout;
            ldap.search_opts = Some(opts.clone());
            let mut stream = SearchStream::new(ldap);
            stream
                .start(base, scope, filter.clone(), attrs.clone())
                .await?;
            while let Some(item) = stream.next().await? {
                if item.is_intermediate() {
                    continue;
                }
                if item.is_ref() {
                    refs.extend(parse_refs(item.0));
                } else {
                    entries.push(item);
                }
            }
            let res = stream.finish().await;
            if res.rc != 0 {
                break res;
            }
            let server_cookie = res.ctrls.iter().find_map(|ctrl| match ctrl {
                Control(Some(ControlType::PagedResults), raw) => {
                    Some(raw.parse::<PagedResults>().cookie)
                }
                _ => None,
            });
            match server_cookie {
                // follow the server's cursor into the next page
                Some(c) if !c.is_empty() => cookie = c,
                // an empty or absent cookie ends the loop
                _ => break res,
            }
        };
        res.refs.extend(refs);
        if res.rc == 4 && opts.sizelimit > 0 {
            res.rc = 0;
        }
        Ok(SearchResult(entries, res))
    }

    /// Add an entry named by `dn`, with the list of attributes and their values
    /// given in `attrs`. None of the `HashSet`s of values for an attribute may
    /// be empty.
    pub async fn add<S: AsRef<[u8]> + Eq + Hash>(
        &mut self,
        dn: &str,
        attrs: Vec<(S, HashSet<S>)>,
    ) -> Result<LdapResult> {
        self.check_dn(dn)?;
        let mut converted = Vec::with_capacity(attrs.len());
        for (name, vals) in attrs {
            if vals.is_empty() {
                return Err(LdapError::AddNoValues);
            }
            converted.push(Attribute {
                name: String::from_utf8_lossy(name.as_ref()).into_owned(),
                values: vals.into_iter().map(|v| v.as_ref().to_vec()).collect(),
            });
        }
        let req = Request::Add {
            dn: String::from(dn),
            attrs: converted,
        };
        Ok(self.op_call(LdapOp::Single, req).await?.0)
    }

    /// Compare the value(s) of the attribute `attr` within an entry named by `dn` with the
    /// value `val`. If any of the values is identical to the provided one, return result code 6
    /// (`compareTrue`), otherwise return result code 5 (`compareFalse`). If access control
    /// rules on the server disallow comparison, another result code will be used to indicate
    /// an error.
    pub async fn compare<B: AsRef<[u8]>>(
        &mut self,
        dn: &str,
        attr: &str,
        val: B,
    ) -> Result<CompareResult> {
        self.check_dn(dn)?;
        let req = Request::Compare {
            dn: String::from(dn),
            attr: String::from(attr),
            value: Vec::from(val.as_ref()),
        };
        Ok(CompareResult(self.op_call(LdapOp::Single, req).await?.0))
    }

    /// Delete an entry named by `dn`.
    pub async fn delete(&mut self, dn: &str) -> Result<LdapResult> {
        self.check_dn(dn)?;
        let req = Request::Delete {
            dn: String::from(dn),
        };
        Ok(self.op_call(LdapOp::Single, req).await?.0)
    }

    /// Modify an entry named by `dn` by sequentially applying the modifications given by `mods`.
    /// See the [`Mod`](enum.Mod.html) documentation for the description of possible values.
    pub async fn modify<S: AsRef<[u8]> + Eq + Hash>(
        &mut self,
        dn: &str,
        mods: Vec<Mod<S>>,
    ) -> Result<LdapResult> {
        self.check_dn(dn)?;
        let mut converted = Vec::with_capacity(mods.len());
        for m in mods {
            if let Mod::Add(_, set) = &m {
                if set.is_empty() {
                    return Err(LdapError::AddNoValues);
                }
            }
            converted.push(m.into_bytes());
        }
        let req = Request::Modify {
            dn: String::from(dn),
            mods: converted,
        };
        Ok(self.op_call(LdapOp::Single, req).await?.0)
    }

    /// Rename and/or move an entry named by `dn`. The new name is given by `rdn`. If
    /// `delete_old` is `true`, delete the previous value of the naming attribute from
    /// the entry. If the entry is to be moved elsewhere in the DIT, `new_sup` gives
    /// the new superior entry where the moved entry will be anchored.
    pub async fn modifydn(
        &mut self,
        dn: &str,
        rdn: &str,
        delete_old: bool,
        new_sup: Option<&str>,
    ) -> Result<LdapResult> {
        self.check_dn(dn)?;
        if let Some(new_sup) = new_sup {
            self.check_dn(new_sup)?;
        }
        let req = Request::ModifyDn {
            dn: String::from(dn),
            rdn: String::from(rdn),
            delete_old,
            new_superior: new_sup.map(String::from),
        };
        Ok(self.op_call(LdapOp::Single, req).await?.0)
    }

    /// Rename and/or move an entry named by `dn` to the composite name
    /// `new_dn`, deleting the old naming attribute. `new_dn` is split at
    /// its first unescaped comma into the new RDN and the new superior;
    /// the split skips `\,` but makes no attempt to handle an escaped
    /// backslash preceding the comma. Call
    /// [`modifydn()`](#method.modifydn) directly when the superior must
    /// be given precisely.
    pub async fn modify_dn(&mut self, dn: &str, new_dn: &str) -> Result<LdapResult> {
        let (rdn, new_sup) = split_first_unescaped_comma(new_dn);
        self.modifydn(dn, rdn, true, new_sup).await
    }

    /// Perform an Extended operation given by `exop`. Extended operations are defined in the
    /// [`exop`](exop/index.html) module. An arbitrary operation can be sent by constructing
    /// an [`Exop`](exop/struct.Exop.html) value with the OID and raw value directly.
    pub async fn extended<E>(&mut self, exop: E) -> Result<ExopResult>
    where
        E: Into<Exop>,
    {
        let req = Request::Extended(exop.into());
        self.op_call(LdapOp::Single, req)
            .await
            .map(|et| ExopResult(et.1, et.0))
    }

    /// Ask the server to upgrade the connection to TLS in place with the
    /// StartTLS extended operation. Requests already in flight stay
    /// pending across the upgrade and are answered on the secured
    /// transport. A `connector` of `None` uses a TLS connector with
    /// default settings.
    pub async fn starttls(&mut self, connector: Option<TlsConnector>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.misc_tx.send(MiscCommand::StartTls {
            connector: connector.map(Box::new),
            tx,
        })?;
        rx.await?
    }

    /// Terminate the connection to the server.
    pub async fn unbind(&mut self) -> Result<()> {
        self.op_call(LdapOp::Unbind, Request::Unbind)
            .await
            .map(|_| ())
    }

    /// Return the message ID of the last active operation. When the handle is initialized, this
    /// value is set to zero. The intended use is to obtain the ID of a timed out operation for
    /// passing it to an Abandon operation.
    pub fn last_id(&mut self) -> RequestId {
        self.last_id
    }

    /// Ask the server to abandon an operation identified by `msgid`. No
    /// response follows; the pending entry for the target operation is
    /// removed as soon as the request is written out.
    pub async fn abandon(&mut self, msgid: RequestId) -> Result<()> {
        self.op_call(LdapOp::Abandon(msgid), Request::Abandon(msgid))
            .await
            .map(|_| ())
    }

    /// Check whether the underlying connection has been closed.
    ///
    /// This is an indirect check: it queries the status of the channel for communicating with
    /// the connection structure, not the connection socket itself. The channel being open
    /// does not mean there is bidirectional communication with the server; to check for that,
    /// a round-trip operation (e.g., `WhoAmI`) would be necessary.
    pub fn is_closed(&mut self) -> bool {
        self.tx.is_closed()
    }
}
