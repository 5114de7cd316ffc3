//! Paged search iteration over the simple-paged-results control.
//!
//! [`PagedSearch`] is lazy and single-pass: each call to `next` yields one
//! entry or referral, transparently requesting the following page when the
//! current one is exhausted. It is not restartable; run a new search to
//! iterate again.

use tracing::{debug, warn};

use crate::codec::{
    result_code, Control, LdapResult, ProtocolOp, SearchRequest, SearchResultEntry,
};
use crate::connection::Connection;
use crate::error::{LdapError, Result};

/// One item of a search result stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageItem {
    Entry(SearchResultEntry),
    /// Continuation references; the engine surfaces them, it does not chase
    /// them.
    Referral(Vec<String>),
}

pub struct PagedSearch<'a> {
    conn: &'a Connection,
    request: SearchRequest,
    extra_controls: Vec<Control>,
    page_size: i32,
    /// None before the first page; the server's cookie afterwards.
    cookie: Option<Vec<u8>>,
    current_id: Option<i32>,
    done: bool,
    size_limit_hit: bool,
    last_result: Option<LdapResult>,
}

impl<'a> PagedSearch<'a> {
    /// `page_size` is capped by the request's own size limit when one is set.
    pub fn new(conn: &'a Connection, request: SearchRequest, page_size: u32) -> Self {
        let effective = if request.size_limit > 0 {
            (page_size as i32).min(request.size_limit)
        } else {
            page_size as i32
        };
        Self {
            conn,
            request,
            extra_controls: Vec::new(),
            page_size: effective,
            cookie: None,
            current_id: None,
            done: false,
            size_limit_hit: false,
            last_result: None,
        }
    }

    /// Attach additional request controls (e.g. ShowDeleted) to every page.
    pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
        self.extra_controls = controls;
        self
    }

    /// Next entry or referral, or `Ok(None)` when the search has finished.
    pub async fn next(&mut self) -> Result<Option<PageItem>> {
        loop {
            let id = match self.current_id {
                Some(id) => id,
                None => {
                    if self.done {
                        return Ok(None);
                    }
                    let id = self.send_page().await?;
                    self.current_id = Some(id);
                    id
                }
            };
            let message = self.conn.wait_for_message(id).await?;
            match message.protocol_op {
                ProtocolOp::SearchResultEntry(entry) => {
                    return Ok(Some(PageItem::Entry(entry)));
                }
                ProtocolOp::SearchResultReference(uris) => {
                    return Ok(Some(PageItem::Referral(uris)));
                }
                ProtocolOp::SearchResultDone(result) => {
                    self.conn.remove_message_queue(id);
                    self.current_id = None;
                    self.finish_page(result, message.controls);
                }
                other => {
                    self.conn.remove_message_queue(id);
                    self.current_id = None;
                    self.done = true;
                    return Err(LdapError::decode(format!(
                        "unexpected message in search result stream: {:?}",
                        other
                    )));
                }
            }
        }
    }

    /// True when iteration ended because the server enforced the size limit.
    pub fn size_limit_hit(&self) -> bool {
        self.size_limit_hit
    }

    /// The final SearchResultDone result of the last completed page.
    pub fn last_result(&self) -> Option<&LdapResult> {
        self.last_result.as_ref()
    }

    async fn send_page(&mut self) -> Result<i32> {
        let mut controls = self.extra_controls.clone();
        controls.push(Control::PagedResults {
            criticality: false,
            size: self.page_size,
            cookie: self.cookie.clone().unwrap_or_default(),
        });
        debug!(
            base = %self.request.base_object,
            page_size = self.page_size,
            continuation = self.cookie.is_some(),
            "requesting search page"
        );
        self.conn.search(self.request.clone(), Some(controls)).await
    }

    fn finish_page(&mut self, result: LdapResult, controls: Option<Vec<Control>>) {
        match result.result_code {
            result_code::SUCCESS => {
                match next_cookie(self.cookie.as_deref(), &controls) {
                    Some(cookie) => self.cookie = Some(cookie),
                    None => self.done = true,
                }
                self.last_result = Some(result);
            }
            result_code::SIZE_LIMIT_EXCEEDED => {
                warn!(
                    size_limit = self.request.size_limit,
                    "search stopped at the server-enforced size limit"
                );
                self.size_limit_hit = true;
                self.last_result = Some(result);
                self.done = true;
            }
            code => {
                debug!(
                    code,
                    "search ended with non-success result: {}", result.diagnostic_message
                );
                self.last_result = Some(result);
                self.done = true;
            }
        }
    }
}

/// Cookie for the next page, or None when iteration must stop: empty cookie,
/// missing paged control, or a cookie identical to the previous one (a
/// repeat would loop forever).
fn next_cookie(previous: Option<&[u8]>, controls: &Option<Vec<Control>>) -> Option<Vec<u8>> {
    let cookie = controls.iter().flatten().find_map(|c| match c {
        Control::PagedResults { cookie, .. } => Some(cookie.clone()),
        _ => None,
    })?;
    if cookie.is_empty() {
        return None;
    }
    if previous == Some(cookie.as_slice()) {
        warn!("server repeated the paged-results cookie, stopping iteration");
        return None;
    }
    Some(cookie)
}
