//! One upstream exchange: send the request, receive the virgin reply,
//! optionally route it through response adaptation, and store the
//! final reply.
//!
//! The original re-entered handler methods from transport and pipe
//! callbacks; here one driver task walks the explicit
//! [ExchangeState]s and awaits each suspension point inline. The
//! exception-like `abortAll`/`abortOnData` escape hatches are modeled
//! as an `Err` bubbling up to [Exchange::run], which funnels every
//! exit through the one-shot [swan_song](Exchange::swan_song) cleanup.

use super::Forwarder;
use crate::context::CoreContext;
use bytes::{Buf, Bytes, BytesMut};
use futures::FutureExt;
use hiero_api::acl::AclAnswer;
use hiero_api::adaptation::AdaptationAnswer;
use hiero_api::body_pipe::{BodyPipe, ConsumerEvent};
use hiero_api::comm::{CommFlag, DynServerConnection};
use hiero_api::error::{ForwardError, ForwardErrorKind};
use hiero_api::http::{HttpReply, HttpRequest};
use hiero_api::select::Destination;
use hiero_api::store::StoreEntry;
use hiero_api::BoxFut;
use std::sync::Arc;

/// Read granularity for reply bodies.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Bound on the overflow scratch buffer that absorbs virgin body
/// bytes the adaptation pipe momentarily refuses.
const MAX_OVERFLOW: usize = 10 * READ_BUFFER_SIZE;

/// Where an exchange currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Writing the request head upstream.
    SendingHeaders,
    /// Pumping the request body upstream.
    SendingBody,
    /// Waiting for the virgin reply head.
    AwaitingReplyHeaders,
    /// Waiting for the adaptation access check or service.
    AwaitingAdaptation,
    /// Moving reply body bytes toward the store.
    StreamingBody,
    /// Upstream is done; draining buffers and adaptation.
    Completing,
    /// The exchange finished.
    Done,
}

#[derive(Debug)]
struct Abort {
    reason: &'static str,
}

type Flow<T = ()> = Result<T, Abort>;

/// One upstream conversation.
pub struct Exchange {
    ctx: Arc<CoreContext>,
    fwd: Arc<Forwarder>,
    request: Arc<HttpRequest>,
    entry: Arc<StoreEntry>,
    conn: DynServerConnection,
    dest: Destination,
    state: ExchangeState,

    virgin_reply: Option<Arc<HttpReply>>,
    final_reply: Option<Arc<HttpReply>>,
    request_body_source: Option<Arc<BodyPipe>>,
    virgin_body_destination: Option<Arc<BodyPipe>>,
    adapted_body_source: Option<Arc<BodyPipe>>,
    adaptation_answer: Option<BoxFut<'static, AdaptationAnswer>>,
    overflow: Option<BytesMut>,

    request_sender: bool,
    current_offset: u64,
    virgin_received: u64,
    server_eof: bool,
    closed_server: bool,
    completed: bool,
    swan_sung: bool,

    received_whole_request_body: bool,
    started_adaptation: bool,
    adaptation_access_check_pending: bool,
    adapted_reply_aborted: bool,
    received_whole_adapted_reply: bool,
    marked_whole: Option<&'static str>,
    done_with_fwd: Option<&'static str>,
}

impl Exchange {
    /// Wire up an exchange over an established connection.
    pub fn new(
        ctx: Arc<CoreContext>,
        fwd: Arc<Forwarder>,
        request: Arc<HttpRequest>,
        entry: Arc<StoreEntry>,
        conn: DynServerConnection,
        dest: Destination,
    ) -> Self {
        Self {
            ctx,
            fwd,
            request,
            entry,
            conn,
            dest,
            state: ExchangeState::SendingHeaders,
            virgin_reply: None,
            final_reply: None,
            request_body_source: None,
            virgin_body_destination: None,
            adapted_body_source: None,
            adaptation_answer: None,
            overflow: None,
            request_sender: false,
            current_offset: 0,
            virgin_received: 0,
            server_eof: false,
            closed_server: false,
            completed: false,
            swan_sung: false,
            received_whole_request_body: false,
            started_adaptation: false,
            adaptation_access_check_pending: false,
            adapted_reply_aborted: false,
            received_whole_adapted_reply: false,
            marked_whole: None,
            done_with_fwd: None,
        }
    }

    /// Drive the exchange to its end. Returns true when the final
    /// reply was stored and forwarding completed.
    pub async fn run(mut self) -> bool {
        let outcome = self.drive().await;
        if let Err(abort) = &outcome {
            tracing::debug!(reason = abort.reason, "exchange aborted");
        }
        self.swan_song().await;
        matches!(outcome, Ok(true))
    }

    async fn drive(&mut self) -> Flow<bool> {
        self.send_request_headers().await?;
        self.send_request_body().await?;
        self.read_reply_headers().await?;
        self.adapt_or_finalize_reply().await?;
        self.stream_reply_body().await?;
        Ok(self.done_with_fwd == Some("completeForwarding()"))
    }

    // --- sending the request ------------------------------------------

    async fn send_request_headers(&mut self) -> Flow {
        self.state = ExchangeState::SendingHeaders;
        let head = self.build_request_head();
        let mut io = self.conn.write(head).await;
        io.sync_with_comm(&*self.conn);
        match io.flag {
            CommFlag::Ok => Ok(()),
            CommFlag::ErrClosing => {
                self.abort_all("connection closed while sending request")
            }
            CommFlag::Err(errno) => {
                self.fwd.fail(
                    ForwardError::new(ForwardErrorKind::WriteError)
                        .with_errno(errno),
                );
                self.abort_on_data("I/O error while sending request")
            }
        }
    }

    fn build_request_head(&self) -> Bytes {
        // peers get the absolute form, origins the origin form
        let target = if self.dest.peer.is_some() {
            self.request.url.as_str().to_string()
        } else {
            let mut target = self.request.url.path().to_string();
            if let Some(query) = self.request.url.query() {
                target.push('?');
                target.push_str(query);
            }
            target
        };
        let mut head = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\n",
            self.request.method,
            target,
            self.request.host(),
        );
        if let Some(size) = self
            .request
            .body_pipe()
            .and_then(|pipe| pipe.body_size())
        {
            head.push_str(&format!("Content-Length: {size}\r\n"));
        }
        head.push_str("\r\n");
        Bytes::from(head)
    }

    async fn send_request_body(&mut self) -> Flow {
        let Some(pipe) = self.request.body_pipe() else {
            return Ok(());
        };
        if !pipe.attach_consumer_if_not_late() {
            tracing::debug!(
                status = pipe.status(),
                "request body was partially consumed already",
            );
            self.fwd.dont_retry(true);
            return self
                .abort_on_data("partially consumed request body");
        }
        self.request_body_source = Some(pipe.clone());
        self.state = ExchangeState::SendingBody;

        loop {
            match pipe.next_data_event().await {
                ConsumerEvent::Data => {
                    let chunk = pipe.content();
                    pipe.consume(chunk.len());
                    self.send_request_body_chunk(chunk).await?;
                }
                ConsumerEvent::Ended => {
                    self.received_whole_request_body = true;
                    self.done_sending_request_body();
                    return Ok(());
                }
                ConsumerEvent::ProducerAborted => {
                    return self
                        .handle_request_body_producer_aborted();
                }
            }
        }
    }

    async fn send_request_body_chunk(&mut self, chunk: Bytes) -> Flow {
        tracing::debug!(
            len = chunk.len(),
            "writing request body bytes",
        );
        debug_assert!(!self.request_sender);
        self.request_sender = true;
        let mut io = self.conn.write(chunk).await;
        self.request_sender = false;
        io.sync_with_comm(&*self.conn);

        if io.flag == CommFlag::ErrClosing {
            // benign: the close handler owns the aftermath
            return self
                .abort_all("connection closed while sending request body");
        }

        if let CommFlag::Err(errno) = io.flag {
            tracing::debug!(errno, "request body write failed");
            self.fwd.fail(
                ForwardError::new(ForwardErrorKind::WriteError)
                    .with_errno(errno),
            );
            return self
                .abort_on_data("I/O error while sending request body");
        }

        if self.entry.aborted() {
            return self.abort_on_data(
                "store entry aborted while sending request body",
            );
        }
        Ok(())
    }

    fn done_sending_request_body(&mut self) {
        tracing::debug!("done sending request body");
        if let Some(pipe) = self.request_body_source.take() {
            Self::stop_consuming(&pipe);
        }
    }

    fn handle_request_body_producer_aborted(&mut self) -> Flow {
        if self.request_sender {
            tracing::debug!("request body aborted while we were sending");
        }
        // the problem is not with the server
        self.fwd.dont_retry(true);
        if let Some(pipe) = self.request_body_source.take() {
            Self::stop_consuming(&pipe);
        }
        self.abort_on_data("request body producer aborted")
    }

    // --- receiving the virgin reply -----------------------------------

    async fn read_reply_headers(&mut self) -> Flow {
        self.state = ExchangeState::AwaitingReplyHeaders;
        let reply = match self.conn.read_reply_head().await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::debug!(?err, "reading reply head failed");
                self.fwd.fail(ForwardError::new(
                    ForwardErrorKind::ReadError,
                ));
                return self
                    .abort_on_data("failed to receive reply headers");
            }
        };
        tracing::debug!(status = reply.status, "virgin reply received");
        self.virgin_reply = Some(reply);
        self.request.add_body_bytes_read(0);
        Ok(())
    }

    // --- adaptation decision ------------------------------------------

    async fn adapt_or_finalize_reply(&mut self) -> Flow {
        let virgin = self.virgin_reply.clone().expect("virgin reply set");

        if let Some(access) = self.ctx.access_check.clone() {
            if self.ctx.adaptation.is_some() {
                // body reading stays suspended until the check answers
                self.adaptation_access_check_pending = true;
                self.state = ExchangeState::AwaitingAdaptation;
                let group =
                    access.start(&self.request, &virgin).await;
                return self
                    .note_adaptation_acl_check_done(group)
                    .await;
            }
        }

        self.set_final_reply(virgin).await
    }

    async fn note_adaptation_acl_check_done(
        &mut self,
        group: Option<hiero_api::adaptation::ServiceGroup>,
    ) -> Flow {
        self.adaptation_access_check_pending = false;
        self.abort_on_bad_entry(
            "entry went bad while waiting for the adaptation check",
        )?;

        let virgin = self.virgin_reply.clone().expect("virgin reply set");
        let max = self.ctx.config.adaptation.max_virgin_body_size;
        if max > 0 {
            if let Some(size) = virgin.body_size {
                if size > max {
                    return self.send_body_is_too_large_error();
                }
            }
        }

        let Some(group) = group else {
            tracing::debug!("no adaptation needed");
            return self.set_final_reply(virgin).await;
        };

        self.start_adaptation(group, virgin);
        Ok(())
    }

    fn send_body_is_too_large_error(&mut self) -> Flow {
        self.fwd
            .fail(ForwardError::new(ForwardErrorKind::TooBig));
        self.fwd.dont_retry(true);
        self.abort_on_data("virgin body too large")
    }

    fn start_adaptation(
        &mut self,
        group: hiero_api::adaptation::ServiceGroup,
        virgin: Arc<HttpReply>,
    ) {
        tracing::debug!(group = %group.name, "starting adaptation");
        debug_assert!(self.virgin_body_destination.is_none());

        if virgin.expects_body(self.request.method)
            && virgin.body_size != Some(0)
        {
            let pipe = Arc::new(BodyPipe::new());
            if let Some(size) = virgin.body_size {
                pipe.set_body_size(size);
            }
            virgin.set_body_pipe(pipe.clone());
            self.virgin_body_destination = Some(pipe);
        }

        let service =
            self.ctx.adaptation.clone().expect("adaptation configured");
        self.adaptation_answer = Some(service.adapt(
            group,
            self.request.clone(),
            virgin,
            self.virgin_body_destination.clone(),
        ));
        self.started_adaptation = true;
    }

    // --- the final reply ----------------------------------------------

    async fn set_final_reply(&mut self, reply: Arc<HttpReply>) -> Flow {
        debug_assert!(self.final_reply.is_none());
        tracing::debug!(status = reply.status, "setting final reply");
        self.final_reply = Some(reply.clone());

        // install on the entry, but do not write yet
        self.entry.replace_reply(reply.clone());
        self.have_parsed_reply_headers(&reply);
        if !self.entry.release_requested() && self.block_caching().await
        {
            tracing::debug!("caching blocked for this miss");
            self.entry.release();
        }
        self.entry.start_writing();
        Ok(())
    }

    fn have_parsed_reply_headers(&mut self, reply: &HttpReply) {
        self.maybe_purge_others(reply);

        // adaptation may move the body to a different range offset
        self.current_offset = reply.content_range_offset.unwrap_or(0);
    }

    async fn block_caching(&self) -> bool {
        if let Some(acl) = &self.ctx.store_miss {
            // when in doubt, block
            if acl.check(&self.request).await != AclAnswer::Allowed {
                return true;
            }
        }
        false
    }

    fn maybe_purge_others(&self, reply: &HttpReply) {
        if !self.request.method.purges_others() {
            return;
        }
        if reply.status >= 400 {
            return;
        }
        let Some(purger) = &self.ctx.purger else { return };

        let request_url = self.request.url.as_str();
        tracing::debug!(
            method = %self.request.method,
            url = request_url,
            "purging related entries",
        );
        purger.purge(request_url);
        self.purge_by_header(purger.as_ref(), reply, "Location");
        self.purge_by_header(purger.as_ref(), reply, "Content-Location");
    }

    fn purge_by_header(
        &self,
        purger: &dyn hiero_api::store::Purger,
        reply: &HttpReply,
        name: &str,
    ) {
        let Some(header_url) = reply.headers.get(name) else { return };

        match url::Url::parse(header_url) {
            Ok(absolute) => {
                // an absolute header URL may only purge entries on the
                // request's own host (RFC 2616 13.10)
                if same_url_hosts(
                    self.request.url.as_str(),
                    absolute.as_str(),
                ) {
                    purger.purge(absolute.as_str());
                }
            }
            Err(_) => {
                // relative: resolve against the request URL
                if let Ok(resolved) = self.request.url.join(header_url) {
                    purger.purge(resolved.as_str());
                }
            }
        }
    }

    // --- reply body streaming -----------------------------------------

    async fn stream_reply_body(&mut self) -> Flow {
        let virgin = self.virgin_reply.clone().expect("virgin reply set");
        let declared = virgin.body_size;
        self.state = ExchangeState::StreamingBody;

        if !virgin.expects_body(self.request.method) {
            self.server_eof = true;
            self.mark_parsed_virgin_reply_as_whole(
                "no reply body expected",
            );
        }

        loop {
            if self.done_with_fwd.is_some() {
                return Ok(());
            }

            // the adaptation side may have lost interest in the body
            if let Some(pipe) = self.virgin_body_destination.clone() {
                if pipe.consumer_aborted() {
                    pipe.stop_producing(false);
                    self.virgin_body_destination = None;
                    if self.done_with_adaptation() {
                        self.handle_adaptation_completed().await?;
                        continue;
                    }
                }
            }

            // an adaptation answer may have arrived
            if let Some(mut fut) = self.adaptation_answer.take() {
                match (&mut fut).now_or_never() {
                    Some(answer) => {
                        self.note_adaptation_answer(answer).await?;
                        continue;
                    }
                    None => self.adaptation_answer = Some(fut),
                }
            }

            // store whatever adapted bytes fit
            if self.adapted_body_source.is_some() {
                self.consume_adapted_body().await?;
                if self.done_with_fwd.is_some() {
                    return Ok(());
                }
            }

            // drain the overflow scratch buffer before reading more
            if self.overflow.is_some() {
                self.add_virgin_reply_body(&[])?;
                if self.overflow.is_some() {
                    self.wait_for_adaptation_event().await?;
                    continue;
                }
            }

            let reply_satisfied = declared
                .map(|size| self.virgin_received >= size)
                .unwrap_or(false);

            if self.completed {
                self.server_complete2().await?;
                if self.done_with_fwd.is_some() {
                    return Ok(());
                }
                self.wait_for_adaptation_event().await?;
                continue;
            }

            if self.server_eof || reply_satisfied {
                if reply_satisfied && self.marked_whole.is_none() {
                    self.mark_parsed_virgin_reply_as_whole(
                        "entire declared body received",
                    );
                } else if self.server_eof
                    && declared.is_none()
                    && self.marked_whole.is_none()
                    && self.virgin_received > 0
                {
                    self.mark_parsed_virgin_reply_as_whole(
                        "connection closed at end of reply",
                    );
                }
                // eof short of the declared size leaves no marker:
                // the reply is truncated
                self.server_complete().await;
                continue;
            }

            // read sizing: respect both our read granularity and the
            // adaptation pipe's remaining capacity
            let space = self.reply_body_space(READ_BUFFER_SIZE);
            if space == 0 {
                self.wait_for_adaptation_event().await?;
                continue;
            }
            let max = declared
                .map(|size| {
                    ((size - self.virgin_received) as usize).min(space)
                })
                .unwrap_or(space);

            let (data, mut io) = self.conn.read_body(max).await;
            io.sync_with_comm(&*self.conn);
            match io.flag {
                CommFlag::ErrClosing => {
                    self.server_eof = true;
                }
                CommFlag::Err(errno) => {
                    self.fwd.fail(
                        ForwardError::new(ForwardErrorKind::ReadError)
                            .with_errno(errno),
                    );
                    return self.abort_on_data(
                        "read failure while streaming reply body",
                    );
                }
                CommFlag::Ok if data.is_empty() => {
                    self.server_eof = true;
                }
                CommFlag::Ok => {
                    if !self.started_adaptation
                        && !self.entry.is_accepting()
                    {
                        return self.abort_on_data(
                            "store entry aborted while streaming",
                        );
                    }
                    self.virgin_received += data.len() as u64;
                    self.add_virgin_reply_body(&data)?;
                }
            }
        }
    }

    fn reply_body_space(&self, want: usize) -> usize {
        if self.overflow.is_some() {
            // already overflowed: reading more can only lose bytes
            return 0;
        }
        let mut space = want;
        if let Some(pipe) = &self.virgin_body_destination {
            space = space.min(pipe.potential_space_size());
        }
        space
    }

    fn mark_parsed_virgin_reply_as_whole(&mut self, reason: &'static str) {
        tracing::debug!(reason, "virgin reply is whole");
        self.marked_whole = Some(reason);
    }

    fn add_virgin_reply_body(&mut self, data: &[u8]) -> Flow {
        self.request.add_body_bytes_read(data.len() as i64);
        debug_assert!(!self.adaptation_access_check_pending);
        if self.started_adaptation {
            self.adapt_virgin_reply_body(data)
        } else {
            self.store_reply_body(data);
            Ok(())
        }
    }

    fn store_reply_body(&mut self, data: &[u8]) {
        self.entry.write(self.current_offset, data);
        self.current_offset += data.len() as u64;
    }

    /// Push virgin body bytes toward adaptation, spilling what the
    /// pipe refuses into the overflow scratch buffer.
    fn adapt_virgin_reply_body(&mut self, data: &[u8]) -> Flow {
        debug_assert!(self.started_adaptation);

        let Some(pipe) = self.virgin_body_destination.clone() else {
            tracing::debug!("adaptation no longer wants the virgin body");
            return Ok(());
        };

        if let Some(overflow) = &mut self.overflow {
            overflow.extend_from_slice(data);
            if overflow.len() > MAX_OVERFLOW {
                return self
                    .abort_all("virgin body overflow out of bounds");
            }
            let taken = pipe.put_more_data(overflow);
            overflow.advance(taken);
            if overflow.is_empty() {
                self.overflow = None;
            }
            return Ok(());
        }

        let taken = pipe.put_more_data(data);
        if taken < data.len() {
            tracing::debug!(
                spilled = data.len() - taken,
                "buffering virgin body bytes the pipe refused",
            );
            let mut overflow = BytesMut::new();
            overflow.extend_from_slice(&data[taken..]);
            self.overflow = Some(overflow);
        }
        Ok(())
    }

    // --- adaptation answers -------------------------------------------

    async fn note_adaptation_answer(
        &mut self,
        answer: AdaptationAnswer,
    ) -> Flow {
        // the head source will not speak again
        self.adaptation_answer = None;
        match answer {
            AdaptationAnswer::Forward(reply) => {
                self.handle_adapted_header(reply).await
            }
            AdaptationAnswer::Block { page_id } => {
                self.handle_adaptation_blocked(page_id)
            }
            AdaptationAnswer::Error { final_ } => {
                self.handle_adaptation_aborted(!final_)
            }
        }
    }

    async fn handle_adapted_header(
        &mut self,
        reply: Arc<HttpReply>,
    ) -> Flow {
        if !self.entry.is_accepting() {
            // nobody will consume the adapted body; let the service
            // finish on its own
            if let Some(pipe) = reply.body_pipe() {
                pipe.expect_no_consumption();
            }
            return self.abort_on_data(
                "entry went bad while waiting for adapted headers",
            );
        }

        self.set_final_reply(reply.clone()).await?;

        debug_assert!(self.adapted_body_source.is_none());
        if let Some(pipe) = reply.body_pipe() {
            self.adapted_body_source = Some(pipe.clone());
            let attached = pipe.attach_consumer_if_not_late();
            debug_assert!(attached);
            self.consume_adapted_body().await?;
        } else {
            debug_assert!(!self.adapted_reply_aborted);
            self.received_whole_adapted_reply = true;
            if self.done_with_adaptation() {
                self.handle_adaptation_completed().await?;
            }
        }
        Ok(())
    }

    fn handle_adaptation_blocked(
        &mut self,
        page_id: Option<String>,
    ) -> Flow {
        self.abort_on_bad_entry(
            "entry went bad while the adaptation service blocked",
        )?;

        if !self.entry.is_empty() {
            // too late to block; should not really happen
            self.request.detail_error(
                ForwardErrorKind::AdaptationFailure,
                "RESPMOD_BLOCK_LATE",
            );
            return self.abort_all("late adaptation block");
        }

        tracing::debug!(?page_id, "adaptation denied client access");
        self.fwd.fail(
            ForwardError::new(ForwardErrorKind::AccessDenied {
                page_id,
            })
            .with_detail("RESPMOD_BLOCK_EARLY"),
        );
        self.fwd.dont_retry(true);
        self.abort_on_data("timely adaptation block")
    }

    fn handle_adaptation_aborted(&mut self, bypassable: bool) -> Flow {
        tracing::debug!(
            bypassable,
            entry_empty = self.entry.is_empty(),
            "adaptation aborted",
        );
        self.abort_on_bad_entry(
            "entry went bad while the adaptation service failed",
        )?;

        self.handled_early_adaptation_abort()?;
        self.abort_all("adaptation failure with a filled entry")
    }

    /// With an empty entry, an adaptation abort is fully handled here
    /// by failing the forward (and the caller's `?` unwinds). With a
    /// filled entry only the log detail is recorded and the caller
    /// decides.
    fn handled_early_adaptation_abort(&mut self) -> Flow {
        if self.entry.is_empty() {
            self.fwd.fail(
                ForwardError::new(ForwardErrorKind::AdaptationFailure)
                    .with_detail("ICAP_RESPMOD_EARLY"),
            );
            self.fwd.dont_retry(true);
            return self
                .abort_all("adaptation failure with an empty entry");
        }

        self.request.detail_error(
            ForwardErrorKind::AdaptationFailure,
            "ICAP_RESPMOD_LATE",
        );
        Ok(())
    }

    // --- adapted body storage -----------------------------------------

    async fn consume_adapted_body(&mut self) -> Flow {
        let Some(src) = self.adapted_body_source.clone() else {
            return Ok(());
        };
        self.abort_on_bad_entry("entry refuses adapted body")?;

        let content = src.content();
        if !content.is_empty() {
            let wanted = self.entry.bytes_wanted(content.len());
            if wanted > 0 {
                tracing::debug!(
                    storing = wanted,
                    offset = self.current_offset,
                    "storing adapted body bytes",
                );
                self.entry.write(self.current_offset, &content[..wanted]);
                self.current_offset += wanted as u64;
                src.consume(wanted);
            } else {
                tracing::debug!(
                    deferred = content.len(),
                    "store refuses adapted body bytes",
                );
            }
        }

        if src.producer_aborted() {
            debug_assert!(!self.received_whole_adapted_reply);
            self.adapted_reply_aborted = true;
        } else if src.produced_whole() {
            self.received_whole_adapted_reply = true;
        }

        if !self.received_whole_adapted_reply
            && !self.adapted_reply_aborted
        {
            // keep waiting: the final-whole decision needs to know
            return Ok(());
        }
        if src.data_size() > 0 {
            // the remainder is stored as the entry frees space
            return Ok(());
        }

        self.adapted_body_source = None;
        if self.adapted_reply_aborted
            && !self.received_whole_adapted_reply
        {
            self.handled_early_adaptation_abort()?;
            // late abort: the user gets a truncated response
        }
        if self.done_with_adaptation() {
            self.handle_adaptation_completed().await?;
        }
        Ok(())
    }

    // --- adaptation bookkeeping ---------------------------------------

    fn done_with_adaptation(&self) -> bool {
        !self.adaptation_access_check_pending
            && self.virgin_body_destination.is_none()
            && self.adaptation_answer.is_none()
            && self.adapted_body_source.is_none()
    }

    async fn handle_adaptation_completed(&mut self) -> Flow {
        tracing::debug!("adaptation completed");
        self.clean_adaptation();

        // any remaining origin body has nowhere to go
        if !self.server_eof && !self.completed {
            tracing::debug!("closing origin connection, reply unwanted");
            self.close_server().await;
            self.server_eof = true;
        }

        self.complete_forwarding();
        Ok(())
    }

    fn clean_adaptation(&mut self) {
        if let Some(pipe) = self.virgin_body_destination.take() {
            pipe.stop_producing(false);
        }
        self.adaptation_answer = None;
        if let Some(pipe) = self.adapted_body_source.take() {
            Self::stop_consuming(&pipe);
        }
        if !self.adaptation_access_check_pending {
            debug_assert!(self.done_with_adaptation());
        }
    }

    // --- completion ----------------------------------------------------

    async fn server_complete(&mut self) {
        tracing::debug!("server communication finished");
        self.state = ExchangeState::Completing;
        self.close_server().await;
        self.completed = true;

        if let Some(pipe) = self.request_body_source.take() {
            Self::stop_consuming(&pipe);
        }
        // with a populated overflow buffer, completion waits for the
        // pipe to drain; the streaming loop keeps going
    }

    async fn server_complete2(&mut self) -> Flow {
        if let Some(pipe) = self.virgin_body_destination.take() {
            pipe.stop_producing(true);
        }
        if !self.done_with_adaptation() {
            return Ok(());
        }
        self.complete_forwarding();
        Ok(())
    }

    fn complete_forwarding(&mut self) {
        if self.done_with_fwd.is_some() {
            return;
        }
        debug_assert!(self.done_with_adaptation());

        let stored_whole = if self.started_adaptation {
            if self.received_whole_adapted_reply {
                Some("receivedWholeAdaptedReply")
            } else {
                None
            }
        } else {
            self.marked_whole
        };
        if let Some(reason) = stored_whole {
            self.fwd.mark_stored_reply_as_whole(reason);
        }

        self.done_with_fwd = Some("completeForwarding()");
        self.state = ExchangeState::Done;
        self.fwd.complete();
    }

    async fn close_server(&mut self) {
        if self.closed_server {
            return;
        }
        self.closed_server = true;
        self.conn.close().await;
    }

    // --- waiting -------------------------------------------------------

    /// Park until any adaptation-related event can make progress:
    /// the service's answer, adapted body activity, virgin pipe space,
    /// or the store accepting bytes again.
    async fn wait_for_adaptation_event(&mut self) -> Flow {
        let entry = self.entry.clone();
        let adapted = self.adapted_body_source.clone();
        let mut answer = self.adaptation_answer.take();

        // wake for data only while the buffer is drained; buffered
        // data means we are waiting on the store instead
        let adapted_wait = adapted
            .clone()
            .filter(|p| p.data_size() == 0);
        let want_kick = adapted
            .as_ref()
            .map(|p| {
                p.data_size() > 0
                    && entry.bytes_wanted(p.data_size()) == 0
            })
            .unwrap_or(false);
        let virgin_wait = self.virgin_body_destination.clone().filter(
            |p| {
                self.overflow.is_some()
                    || p.potential_space_size() == 0
            },
        );

        if answer.is_none()
            && adapted_wait.is_none()
            && !want_kick
            && virgin_wait.is_none()
        {
            return self.abort_all("adaptation cannot make progress");
        }

        let has_answer = answer.is_some();
        let has_adapted_wait = adapted_wait.is_some();
        let has_virgin_wait = virgin_wait.is_some();

        let answered = tokio::select! {
            biased;
            result = async {
                answer.as_mut().expect("checked by branch guard").await
            }, if has_answer => Some(result),
            _ = async {
                adapted_wait
                    .as_ref()
                    .expect("checked by branch guard")
                    .next_data_event()
                    .await
            }, if has_adapted_wait => None,
            _ = async {
                virgin_wait
                    .as_ref()
                    .expect("checked by branch guard")
                    .next_space_event()
                    .await
            }, if has_virgin_wait => None,
            _ = entry.deferred_producer_kick(), if want_kick => None,
        };

        match answered {
            Some(result) => {
                self.note_adaptation_answer(result).await?;
            }
            None => self.adaptation_answer = answer,
        }
        Ok(())
    }

    // --- aborting ------------------------------------------------------

    fn abort_all(&mut self, reason: &'static str) -> Flow {
        tracing::debug!(reason, "aborting everything");
        Err(Abort { reason })
    }

    fn abort_on_data(&mut self, reason: &'static str) -> Flow {
        self.abort_all(reason)
    }

    /// Entry-dependent steps use this to bail out when the entry went
    /// bad underneath them.
    fn abort_on_bad_entry(&mut self, reason: &'static str) -> Flow {
        if self.entry.is_accepting() {
            return Ok(());
        }
        tracing::debug!("entry is not accepting");
        self.abort_on_data(reason)
    }

    fn stop_consuming(pipe: &Arc<BodyPipe>) {
        if pipe.exhausted() || pipe.producer_aborted() {
            return; // nothing left that anyone could miss
        }
        // the producer must learn that nobody reads anymore
        pipe.abort_consumption();
    }

    /// Final cleanup; runs exactly once on every exit path. After it,
    /// all pipe references are gone.
    async fn swan_song(&mut self) {
        if self.swan_sung {
            return;
        }
        self.swan_sung = true;

        if let Some(pipe) = self.request_body_source.take() {
            Self::stop_consuming(&pipe);
        }

        self.clean_adaptation();
        self.close_server().await;

        if self.done_with_fwd.is_none() {
            self.done_with_fwd = Some("swan_song");
            self.fwd.handle_unregistered_server_end();
        }

        debug_assert!(self.request_body_source.is_none());
        debug_assert!(self.virgin_body_destination.is_none());
        debug_assert!(self.adapted_body_source.is_none());
    }

    /// The exchange's current state, for tests and logs.
    pub fn state(&self) -> ExchangeState {
        self.state
    }
}

/// Compare the host parts of two absolute URLs the permissive way the
/// purge path always has: a byte comparison from after the scheme
/// separator to the end of the host, with no case folding and no
/// percent-decoding.
fn same_url_hosts(url1: &str, url2: &str) -> bool {
    let Some(colon1) = url1.find(':') else { return false };
    let Some(colon2) = url2.find(':') else { return false };

    let mut host1 = url1[colon1 + 1..].bytes().peekable();
    let mut host2 = url2[colon2 + 1..].bytes().peekable();

    // skip scheme slashes in lockstep
    while host1.peek() == Some(&b'/') && host2.peek() == Some(&b'/') {
        host1.next();
        host2.next();
    }

    match host1.peek() {
        None => return false, // no host
        Some(_) => {}
    }

    loop {
        match (host1.next(), host2.next()) {
            (a, b) if a != b => return false,
            (None, _) | (Some(b'/'), _) => return true,
            _ => {}
        }
    }
}
