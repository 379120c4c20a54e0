//! The agent: process-wide coordinator of mail operations
//!
//! One [`Agent`] owns the action queue, the attachment tracker, the sync
//! orchestrator and the connectivity gate, and is the only place any of that
//! state is mutated. Requests arrive either through direct method calls (for
//! single-threaded embedding) or through a cloneable [`AgentHandle`] feeding
//! the channel drained by [`Agent::run`]; backend events arrive on a second
//! channel into the same loop, so every mutation is serialized onto one task.
//!
//! Observable state changes go out on a single [`AgentEvent`] stream.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::backend::{classify, Activity, BackendError, BackendEvent, BackendExecutor};
use crate::config::AgentConfig;
use crate::store::{MailStore, StoreEvent};
use crate::sync::action::{Action, ActionKind, Lane};
use crate::sync::attachments::{AttachmentTracker, DownloadRequest};
use crate::sync::connectivity::{ConnectivityMonitor, Transition};
use crate::sync::orchestrator::{chain_action, SyncCommand, SyncOrchestrator};
use crate::sync::queue::{ActionQueue, Enqueued};
use crate::types::error::{AgentError, Result};
use crate::types::{
    message_flags, AccountId, ActionId, AttachmentLocation, AttachmentStatus, FolderId, MessageId,
    SyncError, SyncStatus,
};

/// Event emitted by the agent for UI-layer observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentEvent {
    SynchronizingChanged(SyncStatus),
    CurrentAccountChanged(Option<AccountId>),
    ProgressUpdated(u8),
    AttachmentStatusChanged {
        location: AttachmentLocation,
        status: AttachmentStatus,
    },
    AttachmentProgressChanged {
        location: AttachmentLocation,
        progress: u8,
    },
    /// A backend failure, classified. `account` is absent when the failed
    /// action cannot be attributed to one.
    Error {
        account: Option<AccountId>,
        error: SyncError,
    },
    SendCompleted,
    FolderRetrievalCompleted(AccountId),
    MessagesDownloaded {
        ids: Vec<MessageId>,
        success: bool,
    },
    MessagePartDownloaded {
        message: MessageId,
        part: String,
        success: bool,
    },
    BackendReady,
}

/// Snapshot of the agent's externally relevant state.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub synchronizing: bool,
    pub current_account: Option<AccountId>,
    pub progress: u8,
    pub online: bool,
    pub backend_ready: bool,
    pub pending_actions: usize,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Request forwarded from an [`AgentHandle`] to the agent loop.
#[derive(Debug, Clone)]
pub enum AgentRequest {
    Synchronize(AccountId),
    SynchronizeInbox(AccountId, u32),
    AccountsSync {
        accounts: Vec<AccountId>,
        sync_only_inbox: bool,
        minimum: u32,
    },
    SyncEnabledAccounts,
    CancelSync,
    CancelAll,
    SendMessages(AccountId),
    MoveMessages(Vec<MessageId>, FolderId),
    DeleteMessages(Vec<MessageId>),
    FlagMessages(Vec<MessageId>, u64, u64),
    MarkMessageAsRead(MessageId),
    MarkMessageAsUnread(MessageId),
    DownloadAttachment(AttachmentLocation),
    RetrieveMessageList(AccountId, FolderId, u32),
    RetrieveFolderList(AccountId, Option<FolderId>, bool),
    RetrieveMessages(Vec<MessageId>),
    RetrieveMessageRange(MessageId, u32),
    ExportUpdates(AccountId),
    CreateFolder {
        account: AccountId,
        name: String,
        parent: Option<FolderId>,
    },
    RenameFolder(FolderId, String),
    DeleteFolder(FolderId),
    SearchMessages(AccountId, String),
    PurgeSendingQueue(AccountId),
    SetOnline(bool),
    SetBackendReady(bool),
    StoreChanged(StoreEvent),
    Shutdown,
}

/// Cloneable entry point for callers on other tasks. Every method enqueues
/// a request and returns immediately.
#[derive(Clone)]
pub struct AgentHandle {
    tx: Sender<AgentRequest>,
}

impl AgentHandle {
    fn send(&self, request: AgentRequest) -> Result<()> {
        self.tx.send(request).map_err(|_| AgentError::Stopped)
    }

    pub fn synchronize(&self, account: AccountId) -> Result<()> {
        self.send(AgentRequest::Synchronize(account))
    }

    pub fn synchronize_inbox(&self, account: AccountId, minimum: u32) -> Result<()> {
        self.send(AgentRequest::SynchronizeInbox(account, minimum))
    }

    pub fn accounts_sync(
        &self,
        accounts: Vec<AccountId>,
        sync_only_inbox: bool,
        minimum: u32,
    ) -> Result<()> {
        self.send(AgentRequest::AccountsSync {
            accounts,
            sync_only_inbox,
            minimum,
        })
    }

    pub fn sync_enabled_accounts(&self) -> Result<()> {
        self.send(AgentRequest::SyncEnabledAccounts)
    }

    pub fn cancel_sync(&self) -> Result<()> {
        self.send(AgentRequest::CancelSync)
    }

    pub fn cancel_all(&self) -> Result<()> {
        self.send(AgentRequest::CancelAll)
    }

    pub fn send_messages(&self, account: AccountId) -> Result<()> {
        self.send(AgentRequest::SendMessages(account))
    }

    pub fn move_messages(&self, ids: Vec<MessageId>, destination: FolderId) -> Result<()> {
        self.send(AgentRequest::MoveMessages(ids, destination))
    }

    pub fn delete_messages(&self, ids: Vec<MessageId>) -> Result<()> {
        self.send(AgentRequest::DeleteMessages(ids))
    }

    pub fn flag_messages(&self, ids: Vec<MessageId>, set_mask: u64, unset_mask: u64) -> Result<()> {
        self.send(AgentRequest::FlagMessages(ids, set_mask, unset_mask))
    }

    pub fn mark_message_as_read(&self, message: MessageId) -> Result<()> {
        self.send(AgentRequest::MarkMessageAsRead(message))
    }

    pub fn mark_message_as_unread(&self, message: MessageId) -> Result<()> {
        self.send(AgentRequest::MarkMessageAsUnread(message))
    }

    pub fn download_attachment(&self, location: AttachmentLocation) -> Result<()> {
        self.send(AgentRequest::DownloadAttachment(location))
    }

    pub fn retrieve_message_list(
        &self,
        account: AccountId,
        folder: FolderId,
        minimum: u32,
    ) -> Result<()> {
        self.send(AgentRequest::RetrieveMessageList(account, folder, minimum))
    }

    pub fn retrieve_folder_list(
        &self,
        account: AccountId,
        folder: Option<FolderId>,
        descending: bool,
    ) -> Result<()> {
        self.send(AgentRequest::RetrieveFolderList(account, folder, descending))
    }

    pub fn retrieve_messages(&self, ids: Vec<MessageId>) -> Result<()> {
        self.send(AgentRequest::RetrieveMessages(ids))
    }

    pub fn retrieve_message_range(&self, message: MessageId, minimum: u32) -> Result<()> {
        self.send(AgentRequest::RetrieveMessageRange(message, minimum))
    }

    pub fn export_updates(&self, account: AccountId) -> Result<()> {
        self.send(AgentRequest::ExportUpdates(account))
    }

    pub fn create_folder(
        &self,
        account: AccountId,
        name: String,
        parent: Option<FolderId>,
    ) -> Result<()> {
        self.send(AgentRequest::CreateFolder {
            account,
            name,
            parent,
        })
    }

    pub fn rename_folder(&self, folder: FolderId, name: String) -> Result<()> {
        self.send(AgentRequest::RenameFolder(folder, name))
    }

    pub fn delete_folder(&self, folder: FolderId) -> Result<()> {
        self.send(AgentRequest::DeleteFolder(folder))
    }

    pub fn search_messages(&self, account: AccountId, query: String) -> Result<()> {
        self.send(AgentRequest::SearchMessages(account, query))
    }

    pub fn purge_sending_queue(&self, account: AccountId) -> Result<()> {
        self.send(AgentRequest::PurgeSendingQueue(account))
    }

    pub fn set_online(&self, online: bool) -> Result<()> {
        self.send(AgentRequest::SetOnline(online))
    }

    pub fn set_backend_ready(&self, ready: bool) -> Result<()> {
        self.send(AgentRequest::SetBackendReady(ready))
    }

    pub fn store_changed(&self, event: StoreEvent) -> Result<()> {
        self.send(AgentRequest::StoreChanged(event))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(AgentRequest::Shutdown)
    }
}

/// The coordinator. See the module docs for the threading model.
pub struct Agent {
    config: AgentConfig,
    queue: ActionQueue,
    tracker: AttachmentTracker,
    orchestrator: SyncOrchestrator,
    connectivity: ConnectivityMonitor,
    executor: Box<dyn BackendExecutor>,
    store: Arc<dyn MailStore>,
    enabled_accounts: Vec<AccountId>,
    backend_ready: bool,
    cancelling: bool,
    next_action_id: u64,
    last_sync: Option<DateTime<Utc>>,
    events: Sender<AgentEvent>,
    backend_rx: Receiver<BackendEvent>,
    requests_rx: Receiver<AgentRequest>,
}

impl Agent {
    /// Build an agent around an executor and its backend event channel.
    /// Returns the agent itself (for direct driving), a handle feeding the
    /// request channel, and the event stream.
    pub fn new(
        executor: Box<dyn BackendExecutor>,
        backend_events: Receiver<BackendEvent>,
        store: Arc<dyn MailStore>,
        config: AgentConfig,
    ) -> (Agent, AgentHandle, Receiver<AgentEvent>) {
        let (events_tx, events_rx) = flume::unbounded();
        let (requests_tx, requests_rx) = flume::unbounded();

        let enabled_accounts = store.enabled_accounts();
        let agent = Agent {
            config,
            queue: ActionQueue::new(),
            tracker: AttachmentTracker::new(),
            orchestrator: SyncOrchestrator::new(store.clone()),
            connectivity: ConnectivityMonitor::default(),
            executor,
            store,
            enabled_accounts,
            backend_ready: false,
            cancelling: false,
            next_action_id: 0,
            last_sync: None,
            events: events_tx,
            backend_rx: backend_events,
            requests_rx,
        };

        (agent, AgentHandle { tx: requests_tx }, events_rx)
    }

    /// Build an agent and run its loop on a new task.
    pub fn spawn(
        executor: Box<dyn BackendExecutor>,
        backend_events: Receiver<BackendEvent>,
        store: Arc<dyn MailStore>,
        config: AgentConfig,
    ) -> (
        AgentHandle,
        Receiver<AgentEvent>,
        tokio::task::JoinHandle<()>,
    ) {
        let (agent, handle, events) = Agent::new(executor, backend_events, store, config);
        let join = tokio::spawn(agent.run());
        (handle, events, join)
    }

    /// Drain requests and backend events until shutdown. All state mutation
    /// happens here, one message at a time.
    pub async fn run(mut self) {
        info!("agent loop started");
        let requests = self.requests_rx.clone();
        let backend = self.backend_rx.clone();

        loop {
            tokio::select! {
                request = requests.recv_async() => match request {
                    Ok(AgentRequest::Shutdown) => {
                        info!("agent shutting down");
                        break;
                    }
                    Ok(request) => self.handle_request(request),
                    Err(_) => {
                        info!("all agent handles dropped, stopping");
                        break;
                    }
                },
                event = backend.recv_async() => match event {
                    Ok(event) => self.handle_backend_event(event),
                    Err(_) => {
                        warn!("backend event channel closed, stopping");
                        break;
                    }
                },
            }
        }
    }

    fn handle_request(&mut self, request: AgentRequest) {
        match request {
            AgentRequest::Synchronize(account) => self.synchronize(account),
            AgentRequest::SynchronizeInbox(account, minimum) => {
                self.synchronize_inbox(account, minimum)
            }
            AgentRequest::AccountsSync {
                accounts,
                sync_only_inbox,
                minimum,
            } => self.accounts_sync(accounts, sync_only_inbox, minimum),
            AgentRequest::SyncEnabledAccounts => self.sync_enabled_accounts(),
            AgentRequest::CancelSync => self.cancel_sync(),
            AgentRequest::CancelAll => self.cancel_all(),
            AgentRequest::SendMessages(account) => self.send_messages(account),
            AgentRequest::MoveMessages(ids, destination) => self.move_messages(ids, destination),
            AgentRequest::DeleteMessages(ids) => self.delete_messages(ids),
            AgentRequest::FlagMessages(ids, set_mask, unset_mask) => {
                self.flag_messages(ids, set_mask, unset_mask)
            }
            AgentRequest::MarkMessageAsRead(message) => self.mark_message_as_read(message),
            AgentRequest::MarkMessageAsUnread(message) => self.mark_message_as_unread(message),
            AgentRequest::DownloadAttachment(location) => self.download_attachment(location),
            AgentRequest::RetrieveMessageList(account, folder, minimum) => {
                self.retrieve_message_list(account, folder, minimum);
            }
            AgentRequest::RetrieveFolderList(account, folder, descending) => {
                self.retrieve_folder_list(account, folder, descending);
            }
            AgentRequest::RetrieveMessages(ids) => self.retrieve_messages(ids),
            AgentRequest::RetrieveMessageRange(message, minimum) => {
                self.retrieve_message_range(message, minimum);
            }
            AgentRequest::ExportUpdates(account) => {
                self.export_updates(account);
            }
            AgentRequest::CreateFolder {
                account,
                name,
                parent,
            } => self.create_folder(account, name, parent),
            AgentRequest::RenameFolder(folder, name) => self.rename_folder(folder, name),
            AgentRequest::DeleteFolder(folder) => {
                self.delete_folder(folder);
            }
            AgentRequest::SearchMessages(account, query) => self.search_messages(account, query),
            AgentRequest::PurgeSendingQueue(account) => {
                self.purge_sending_queue(account);
            }
            AgentRequest::SetOnline(online) => self.set_online(online),
            AgentRequest::SetBackendReady(ready) => self.set_backend_ready(ready),
            AgentRequest::StoreChanged(event) => self.handle_store_event(event),
            AgentRequest::Shutdown => {}
        }
    }

    // ------------------------------------------------------------------
    // Request API
    // ------------------------------------------------------------------

    /// Full sync of a single account.
    pub fn synchronize(&mut self, account: AccountId) {
        let minimum = self.config.sync_minimum;
        self.accounts_sync(vec![account], false, minimum);
    }

    /// Inbox-only sync of a single account.
    pub fn synchronize_inbox(&mut self, account: AccountId, minimum: u32) {
        self.accounts_sync(vec![account], true, minimum);
    }

    /// Sync a list of accounts in order. Rejected while a run is active.
    pub fn accounts_sync(
        &mut self,
        accounts: Vec<AccountId>,
        sync_only_inbox: bool,
        minimum: u32,
    ) {
        let commands = self.orchestrator.begin(accounts, sync_only_inbox, minimum);
        if commands.is_empty() {
            warn!("sync request rejected, a run is already active");
            return;
        }
        self.apply(commands);
    }

    /// Sync every account currently enabled in the store, using configured
    /// defaults.
    pub fn sync_enabled_accounts(&mut self) {
        let accounts = self.enabled_accounts.clone();
        let sync_only_inbox = self.config.sync_only_inbox;
        let minimum = self.config.sync_minimum;
        self.accounts_sync(accounts, sync_only_inbox, minimum);
    }

    /// Abort the current sync run. The in-flight chain step is cancelled at
    /// the backend; remaining accounts are not synchronized.
    pub fn cancel_sync(&mut self) {
        let Some(account) = self.orchestrator.current_account() else {
            debug!("cancel requested with no sync in progress");
            return;
        };
        info!("cancelling sync at account {}", account);

        if let Some(current) = self.queue.current(Lane::Retrieval) {
            if chain_action(current.kind(), account) {
                self.cancelling = true;
                self.executor.cancel(Lane::Retrieval);
            }
        }

        let commands = self.orchestrator.cancel();
        self.apply(commands);
        self.after_terminal();
    }

    /// Cancel everything: in-flight network actions are cancelled at the
    /// backend, all pending actions are dropped. A storage mutation already
    /// in flight is not cancellable and completes on its own.
    pub fn cancel_all(&mut self) {
        self.cancelling = true;
        for lane in Lane::NETWORK {
            if self.queue.current(lane).is_some() {
                self.executor.cancel(lane);
            }
        }
        let dropped = self.queue.cancel_pending();
        if dropped > 0 {
            info!("dropped {} pending action(s)", dropped);
        }
        let commands = self.orchestrator.cancel();
        self.apply(commands);
        self.after_terminal();
    }

    /// Transmit the account's outbox, if it has anything waiting.
    pub fn send_messages(&mut self, account: AccountId) {
        if !self.store.has_messages_in_outbox(account) {
            debug!("outbox of account {} is empty, nothing to send", account);
            return;
        }
        self.enqueue(ActionKind::Send { account });
    }

    pub fn move_messages(&mut self, ids: Vec<MessageId>, destination: FolderId) {
        if ids.is_empty() {
            return;
        }
        self.enqueue(ActionKind::MoveMessages { ids, destination });
    }

    pub fn delete_messages(&mut self, ids: Vec<MessageId>) {
        if ids.is_empty() {
            return;
        }
        self.enqueue(ActionKind::DeleteMessages { ids });
    }

    pub fn flag_messages(&mut self, ids: Vec<MessageId>, set_mask: u64, unset_mask: u64) {
        if ids.is_empty() || (set_mask == 0 && unset_mask == 0) {
            return;
        }
        self.enqueue(ActionKind::FlagMessages {
            ids,
            set_mask,
            unset_mask,
        });
    }

    pub fn mark_message_as_read(&mut self, message: MessageId) {
        self.flag_messages(vec![message], message_flags::READ, 0);
    }

    pub fn mark_message_as_unread(&mut self, message: MessageId) {
        self.flag_messages(vec![message], 0, message_flags::READ);
    }

    /// Start (or join) the download of an attachment part. A location that
    /// is already queued or downloading is not requested a second time.
    pub fn download_attachment(&mut self, location: AttachmentLocation) {
        match self.tracker.request(location.clone()) {
            DownloadRequest::AlreadyActive(status) => {
                debug!("download of {} already underway ({:?})", location, status);
            }
            DownloadRequest::New => {
                self.emit(AgentEvent::AttachmentStatusChanged {
                    location: location.clone(),
                    status: AttachmentStatus::Queued,
                });
                self.enqueue(ActionKind::RetrieveMessagePart { location });
            }
        }
    }

    pub fn retrieve_message_list(
        &mut self,
        account: AccountId,
        folder: FolderId,
        minimum: u32,
    ) -> ActionId {
        self.enqueue(ActionKind::RetrieveMessageList {
            account,
            folder,
            minimum,
        })
    }

    pub fn retrieve_folder_list(
        &mut self,
        account: AccountId,
        folder: Option<FolderId>,
        descending: bool,
    ) -> ActionId {
        self.enqueue(ActionKind::RetrieveFolderList {
            account,
            folder,
            descending,
        })
    }

    pub fn retrieve_messages(&mut self, ids: Vec<MessageId>) {
        if ids.is_empty() {
            return;
        }
        self.enqueue(ActionKind::RetrieveMessages { ids });
    }

    pub fn retrieve_message_range(&mut self, message: MessageId, minimum: u32) -> ActionId {
        self.enqueue(ActionKind::RetrieveMessageRange { message, minimum })
    }

    /// Push locally recorded changes of an account to the server.
    pub fn export_updates(&mut self, account: AccountId) -> ActionId {
        self.enqueue(ActionKind::ExportUpdates { account })
    }

    pub fn create_folder(
        &mut self,
        account: AccountId,
        name: String,
        parent: Option<FolderId>,
    ) {
        if name.is_empty() {
            warn!("refusing to create folder with empty name");
            return;
        }
        self.enqueue(ActionKind::CreateFolder {
            account,
            name,
            parent,
        });
    }

    pub fn rename_folder(&mut self, folder: FolderId, name: String) {
        if name.is_empty() {
            warn!("refusing to rename folder {} to an empty name", folder);
            return;
        }
        self.enqueue(ActionKind::RenameFolder { folder, name });
    }

    pub fn delete_folder(&mut self, folder: FolderId) -> ActionId {
        self.enqueue(ActionKind::DeleteFolder { folder })
    }

    pub fn search_messages(&mut self, account: AccountId, query: String) {
        if query.is_empty() {
            return;
        }
        let limit = self.config.search_limit;
        self.enqueue(ActionKind::Search {
            account,
            query,
            limit,
        });
    }

    pub fn purge_sending_queue(&mut self, account: AccountId) -> ActionId {
        self.enqueue(ActionKind::PurgeSendingQueue { account })
    }

    /// Record the network state observed by the external connectivity
    /// source. Going offline cancels in-flight network actions; coming back
    /// resumes dispatch and re-issues interrupted sync steps.
    pub fn set_online(&mut self, online: bool) {
        match self.connectivity.set_online(online) {
            Some(Transition::WentOffline) => {
                for lane in Lane::NETWORK {
                    if self.queue.current(lane).is_some() {
                        info!("offline, cancelling current {:?} action", lane);
                        self.executor.cancel(lane);
                    }
                }
            }
            Some(Transition::WentOnline) => {
                let commands = self.orchestrator.resume();
                self.apply(commands);
                self.dispatch();
            }
            None => {}
        }
    }

    /// Record whether the IPC connection to the backend process is up.
    /// Nothing dispatches until it is.
    pub fn set_backend_ready(&mut self, ready: bool) {
        if self.backend_ready == ready {
            return;
        }
        self.backend_ready = ready;
        if ready {
            info!("backend connection established");
            self.emit(AgentEvent::BackendReady);
            self.dispatch();
        } else {
            warn!("backend connection lost");
        }
    }

    /// React to a change notification from the mail store.
    pub fn handle_store_event(&mut self, event: StoreEvent) {
        match event {
            StoreEvent::AccountsAdded(ids) => {
                info!("{} account(s) added", ids.len());
                self.enabled_accounts = self.store.enabled_accounts();
            }
            StoreEvent::AccountsRemoved(ids) => {
                info!("{} account(s) removed", ids.len());
                self.enabled_accounts = self.store.enabled_accounts();
                self.queue.remove_pending(|action| {
                    action
                        .kind()
                        .account()
                        .map(|account| ids.contains(&account))
                        .unwrap_or(false)
                });
                let commands = self.orchestrator.remove_accounts(&ids);
                self.apply(commands);
            }
            StoreEvent::AccountsUpdated(_) => {
                self.enabled_accounts = self.store.enabled_accounts();
            }
            StoreEvent::MessagesRemoved(ids) => {
                for message in ids {
                    let dropped = self.tracker.forget_message(message);
                    if dropped > 0 {
                        debug!(
                            "dropped {} tracked download(s) of removed message {}",
                            dropped, message
                        );
                    }
                }
            }
            // List projections own these; nothing cached here depends on them.
            StoreEvent::MessagesAdded(_) | StoreEvent::FoldersChanged(_) => {}
        }
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            synchronizing: self.orchestrator.is_active(),
            current_account: self.orchestrator.current_account(),
            progress: self.orchestrator.reported_percent(),
            online: self.connectivity.is_online(),
            backend_ready: self.backend_ready,
            pending_actions: self.queue.pending_len(),
            last_sync: self.last_sync,
        }
    }

    pub fn synchronizing(&self) -> bool {
        self.orchestrator.is_active()
    }

    pub fn current_synchronizing_account(&self) -> Option<AccountId> {
        self.orchestrator.current_account()
    }

    pub fn attachment_status(&self, location: &AttachmentLocation) -> AttachmentStatus {
        self.tracker.status(location)
    }

    pub fn attachment_progress(&self, location: &AttachmentLocation) -> u8 {
        self.tracker.progress(location)
    }

    /// Action currently executing on a lane, if any.
    pub fn current_action(&self, lane: Lane) -> Option<&Action> {
        self.queue.current(lane)
    }

    /// Process all backend events waiting on the channel. [`run`](Self::run)
    /// does this continuously; direct-driving embedders call it when the
    /// backend signals activity.
    pub fn drain_backend(&mut self) {
        while let Ok(event) = self.backend_rx.try_recv() {
            self.handle_backend_event(event);
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn enqueue(&mut self, kind: ActionKind) -> ActionId {
        self.next_action_id += 1;
        let action = Action::new(ActionId(self.next_action_id), kind);
        let result = self.queue.enqueue(action);
        if let Enqueued::Accepted(id) = result {
            debug!("enqueued action {}", id);
            self.dispatch();
        }
        result.id()
    }

    /// Hand dispatchable actions to the executor until every admissible lane
    /// is busy. Suspended entirely while cancelling or while the backend
    /// connection is down; network lanes are additionally gated by
    /// connectivity.
    fn dispatch(&mut self) {
        if self.cancelling || !self.backend_ready {
            return;
        }

        let mut rejected = Vec::new();
        loop {
            let online = self.connectivity.is_online();
            let Some(action) = self.queue.take_next(|a| online || !a.needs_network()) else {
                break;
            };
            debug!(
                "dispatching {} action {} on {:?}",
                action.kind().kind_str(),
                action.id(),
                action.lane()
            );
            if let Err(e) = self.executor.start(&action) {
                error!("failed to start action {}: {}", action.id(), e);
                self.queue.complete(action.lane(), action.id());
                rejected.push(action);
            }
        }

        for action in rejected {
            self.handle_failure(action, BackendError::Internal);
        }
    }

    fn handle_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::Progress {
                lane,
                action,
                value,
                total,
            } => self.on_backend_progress(lane, action, value, total),
            BackendEvent::ActivityChanged {
                lane,
                action,
                activity,
            } => match activity {
                Activity::InProgress => {
                    debug!("action {} in progress on {:?}", action, lane);
                }
                Activity::Succeeded => self.on_action_succeeded(lane, action),
                Activity::Failed(error) => self.on_action_failed(lane, action, error),
            },
        }
    }

    fn on_backend_progress(&mut self, lane: Lane, id: ActionId, value: u32, total: u32) {
        let Some(action) = self.queue.current(lane) else {
            debug!("progress for idle lane {:?}, ignoring", lane);
            return;
        };
        if action.id() != id {
            debug!("stale progress for action {}, ignoring", id);
            return;
        }
        let kind = action.kind().clone();

        match &kind {
            ActionKind::RetrieveMessagePart { location } => {
                let percent = scale_percent(value, total);
                if let Some(status) = self.tracker.set_progress(location, percent) {
                    self.emit(AgentEvent::AttachmentStatusChanged {
                        location: location.clone(),
                        status,
                    });
                }
                self.emit(AgentEvent::AttachmentProgressChanged {
                    location: location.clone(),
                    progress: self.tracker.progress(location),
                });
            }
            _ => {
                if let Some(percent) = self.orchestrator.on_progress(&kind, value, total) {
                    self.emit(AgentEvent::ProgressUpdated(percent));
                }
            }
        }
    }

    fn on_action_succeeded(&mut self, lane: Lane, id: ActionId) {
        let Some(action) = self.queue.complete(lane, id) else {
            debug!("stale success callback for action {}, ignoring", id);
            return;
        };
        debug!(
            "completed {} action {}",
            action.kind().kind_str(),
            action.id()
        );

        match action.kind() {
            ActionKind::RetrieveMessagePart { location } => {
                let saved = match self.store.save_attachment(location) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("failed to save attachment {}: {}", location, e);
                        false
                    }
                };
                let status = self.tracker.complete(location, saved);
                self.emit(AgentEvent::AttachmentProgressChanged {
                    location: location.clone(),
                    progress: self.tracker.progress(location),
                });
                self.emit(AgentEvent::AttachmentStatusChanged {
                    location: location.clone(),
                    status,
                });
                self.emit(AgentEvent::MessagePartDownloaded {
                    message: location.message,
                    part: location.part.clone(),
                    success: true,
                });
            }
            ActionKind::RetrieveMessages { ids } => {
                self.emit(AgentEvent::MessagesDownloaded {
                    ids: ids.clone(),
                    success: true,
                });
            }
            ActionKind::RetrieveFolderList { account, .. } => {
                self.emit(AgentEvent::FolderRetrievalCompleted(*account));
            }
            ActionKind::Send { .. } => {
                self.emit(AgentEvent::SendCompleted);
            }
            _ => {}
        }

        let commands = self.orchestrator.on_action_completed(action.kind());
        self.apply(commands);
        self.after_terminal();
    }

    fn on_action_failed(&mut self, lane: Lane, id: ActionId, error: BackendError) {
        let Some(action) = self.queue.complete(lane, id) else {
            debug!("stale failure callback for action {}, ignoring", id);
            return;
        };
        self.handle_failure(action, error);
    }

    /// Shared terminal-failure path for backend failures and rejected
    /// starts. Exactly one observable status transition per outcome.
    fn handle_failure(&mut self, action: Action, error: BackendError) {
        match classify(error) {
            None => {
                debug!(
                    "{} action {} cancelled",
                    action.kind().kind_str(),
                    action.id()
                );
                if let ActionKind::RetrieveMessagePart { location } = action.kind() {
                    let status = self.tracker.fail(location);
                    self.emit(AgentEvent::AttachmentStatusChanged {
                        location: location.clone(),
                        status,
                    });
                }
                // An interrupted sync step is re-issued once the network is
                // back; a cancelled run has no orchestrator state left.
                if self.connectivity.is_online() && !self.cancelling {
                    let commands = self.orchestrator.resume();
                    self.apply(commands);
                }
            }
            Some(sync_error) => {
                warn!(
                    "{} action {} failed: {:?}",
                    action.kind().kind_str(),
                    action.id(),
                    sync_error
                );
                match action.kind() {
                    ActionKind::RetrieveMessagePart { location } => {
                        let status = self.tracker.fail(location);
                        self.emit(AgentEvent::AttachmentStatusChanged {
                            location: location.clone(),
                            status,
                        });
                        self.emit(AgentEvent::MessagePartDownloaded {
                            message: location.message,
                            part: location.part.clone(),
                            success: false,
                        });
                    }
                    ActionKind::RetrieveMessages { ids } => {
                        self.emit(AgentEvent::MessagesDownloaded {
                            ids: ids.clone(),
                            success: false,
                        });
                    }
                    _ => {}
                }

                let account = self.account_for(&action);
                self.emit(AgentEvent::Error {
                    account,
                    error: sync_error,
                });

                let commands = self.orchestrator.on_action_failed(action.kind(), sync_error);
                self.apply(commands);
            }
        }
        self.after_terminal();
    }

    /// Bookkeeping after any terminal callback: finish a drain-out
    /// cancellation once every lane is free, then try to dispatch.
    fn after_terminal(&mut self) {
        if self.cancelling && !self.queue.has_current() {
            debug!("cancellation drained, queue resumes");
            self.cancelling = false;
        }
        self.dispatch();
    }

    fn apply(&mut self, commands: Vec<SyncCommand>) {
        for command in commands {
            match command {
                SyncCommand::Enqueue(kind) => {
                    self.enqueue(kind);
                }
                SyncCommand::DropPending(account) => {
                    let dropped = self
                        .queue
                        .remove_pending(|action| chain_action(action.kind(), account));
                    if dropped > 0 {
                        debug!(
                            "dropped {} pending sync step(s) of account {}",
                            dropped, account
                        );
                    }
                }
                SyncCommand::Status(status) => {
                    if status == SyncStatus::Completed {
                        self.last_sync = Some(Utc::now());
                        if self.config.background_process {
                            info!("background sync finished");
                        }
                    }
                    self.emit(AgentEvent::SynchronizingChanged(status));
                }
                SyncCommand::CurrentAccount(account) => {
                    self.emit(AgentEvent::CurrentAccountChanged(account));
                }
                SyncCommand::Progress(percent) => {
                    self.emit(AgentEvent::ProgressUpdated(percent));
                }
            }
        }
    }

    /// Best-effort account attribution for error reporting.
    fn account_for(&self, action: &Action) -> Option<AccountId> {
        if let Some(account) = action.kind().account() {
            return Some(account);
        }
        match action.kind() {
            ActionKind::RetrieveMessagePart { location } => {
                self.store.account_of_message(location.message)
            }
            ActionKind::RetrieveMessageRange { message, .. } => {
                self.store.account_of_message(*message)
            }
            _ => action
                .kind()
                .message_ids()
                .and_then(|ids| ids.first())
                .and_then(|id| self.store.account_of_message(*id)),
        }
    }

    fn emit(&self, event: AgentEvent) {
        if self.events.send(event).is_err() {
            warn!("no event subscribers, dropping agent event");
        }
    }
}

fn scale_percent(value: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    ((value as u64 * 100) / total as u64).min(100) as u8
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::testing::{MockBackend, MockExecutor};
    use crate::store::testing::MemoryStore;

    fn setup() -> (Agent, MockBackend, Receiver<AgentEvent>, Arc<MemoryStore>) {
        let (executor, mock, backend_rx) = MockExecutor::new();
        let store = Arc::new(MemoryStore::new());
        let (agent, _handle, events) = Agent::new(
            Box::new(executor),
            backend_rx,
            store.clone(),
            AgentConfig::default(),
        );
        (agent, mock, events, store)
    }

    fn ready(agent: &mut Agent) {
        agent.set_backend_ready(true);
    }

    fn drain(events: &Receiver<AgentEvent>) -> Vec<AgentEvent> {
        events.try_iter().collect()
    }

    /// Succeed or fail retrieval-chain actions until the run finishes.
    /// `fail` maps an account to the backend error its chain should hit.
    fn drive_run<F>(agent: &mut Agent, mock: &MockBackend, fail: F)
    where
        F: Fn(AccountId) -> Option<BackendError>,
    {
        let mut guard = 0;
        while agent.synchronizing() {
            guard += 1;
            assert!(guard < 100, "sync run did not converge");

            let Some((lane, id, kind)) = agent
                .current_action(Lane::Retrieval)
                .map(|a| (a.lane(), a.id(), a.kind().clone()))
            else {
                // Nothing in flight on the retrieval lane; drain transmit.
                if let Some(action) = agent.current_action(Lane::Transmit) {
                    let (lane, id) = (action.lane(), action.id());
                    mock.succeed(lane, id);
                    agent.drain_backend();
                    continue;
                }
                panic!("sync active but no chain action in flight");
            };

            let account = kind.account().expect("chain actions name an account");
            match fail(account) {
                Some(error) => mock.fail(lane, id, error),
                None => mock.succeed(lane, id),
            }
            agent.drain_backend();
        }
    }

    #[test]
    fn test_lane_fifo_and_single_slot() {
        let (mut agent, mock, _events, _store) = setup();
        ready(&mut agent);

        let first = agent.retrieve_message_list(AccountId(1), FolderId(10), 20);
        let second = agent.retrieve_message_list(AccountId(1), FolderId(11), 20);

        // Only the first action of the lane was started.
        assert_eq!(mock.starts(), vec![(Lane::Retrieval, first)]);

        mock.succeed(Lane::Retrieval, first);
        agent.drain_backend();
        assert_eq!(
            mock.starts(),
            vec![(Lane::Retrieval, first), (Lane::Retrieval, second)]
        );
    }

    #[test]
    fn test_lanes_run_in_parallel() {
        let (mut agent, mock, _events, _store) = setup();
        ready(&mut agent);

        agent.retrieve_message_list(AccountId(1), FolderId(10), 20);
        agent.delete_messages(vec![MessageId(5)]);

        let lanes: Vec<Lane> = mock.starts().iter().map(|(lane, _)| *lane).collect();
        assert_eq!(lanes, vec![Lane::Retrieval, Lane::Storage]);
    }

    #[test]
    fn test_equivalent_enqueue_is_noop() {
        let (mut agent, mock, _events, _store) = setup();
        ready(&mut agent);

        let first = agent.retrieve_message_list(AccountId(1), FolderId(10), 20);
        mock.succeed(Lane::Retrieval, first);
        // Terminal not yet drained: the action is still current.
        let dup = agent.retrieve_message_list(AccountId(1), FolderId(10), 50);

        assert_eq!(dup, first);
        assert_eq!(agent.status().pending_actions, 0);
        assert_eq!(mock.starts().len(), 1);
    }

    #[test]
    fn test_dispatch_waits_for_backend_ready() {
        let (mut agent, mock, _events, _store) = setup();

        agent.retrieve_message_list(AccountId(1), FolderId(10), 20);
        assert!(mock.starts().is_empty());

        ready(&mut agent);
        assert_eq!(mock.starts().len(), 1);
    }

    #[test]
    fn test_download_attachment_dedups() {
        let (mut agent, mock, events, _store) = setup();
        ready(&mut agent);
        let location = AttachmentLocation::new(MessageId(1), "2");

        agent.download_attachment(location.clone());
        agent.download_attachment(location.clone());
        assert_eq!(mock.starts().len(), 1);

        // Progress moves it to Downloading; still no second retrieval.
        let id = mock.last_started(Lane::Retrieval).unwrap();
        mock.progress(Lane::Retrieval, id, 10, 100);
        agent.drain_backend();
        agent.download_attachment(location.clone());
        assert_eq!(mock.starts().len(), 1);
        assert_eq!(
            agent.attachment_status(&location),
            AttachmentStatus::Downloading
        );
        assert_eq!(agent.attachment_progress(&location), 10);

        let seen = drain(&events);
        assert!(seen.contains(&AgentEvent::AttachmentStatusChanged {
            location: location.clone(),
            status: AttachmentStatus::Queued,
        }));
        assert!(seen.contains(&AgentEvent::AttachmentStatusChanged {
            location,
            status: AttachmentStatus::Downloading,
        }));
    }

    #[test]
    fn test_attachment_download_saves_and_completes() {
        let (mut agent, mock, events, store) = setup();
        ready(&mut agent);
        let location = AttachmentLocation::new(MessageId(1), "2");

        agent.download_attachment(location.clone());
        let id = mock.last_started(Lane::Retrieval).unwrap();
        mock.succeed(Lane::Retrieval, id);
        agent.drain_backend();

        assert_eq!(
            agent.attachment_status(&location),
            AttachmentStatus::Downloaded
        );
        assert_eq!(store.saved_attachments(), vec![location.clone()]);
        assert!(drain(&events).contains(&AgentEvent::MessagePartDownloaded {
            message: MessageId(1),
            part: "2".to_string(),
            success: true,
        }));
    }

    #[test]
    fn test_attachment_save_failure_is_local_only() {
        let (mut agent, mock, events, store) = setup();
        ready(&mut agent);
        store.set_fail_save(true);
        let location = AttachmentLocation::new(MessageId(1), "2");

        agent.download_attachment(location.clone());
        let id = mock.last_started(Lane::Retrieval).unwrap();
        mock.succeed(Lane::Retrieval, id);
        agent.drain_backend();

        assert_eq!(
            agent.attachment_status(&location),
            AttachmentStatus::FailedToSave
        );
        // FailedToSave flows only through the attachment status channel,
        // never through the error signal.
        let seen = drain(&events);
        assert!(seen.contains(&AgentEvent::AttachmentStatusChanged {
            location,
            status: AttachmentStatus::FailedToSave,
        }));
        assert!(!seen
            .iter()
            .any(|e| matches!(e, AgentEvent::Error { .. })));
    }

    #[test]
    fn test_failed_account_does_not_block_later_ones() {
        let (mut agent, mock, events, store) = setup();
        ready(&mut agent);
        for account in [1u64, 2, 3] {
            store.add_account(
                AccountId(account),
                FolderId(account * 10),
                vec![FolderId(account * 10)],
            );
        }

        agent.accounts_sync(
            vec![AccountId(1), AccountId(2), AccountId(3)],
            false,
            20,
        );
        drive_run(&mut agent, &mock, |account| {
            (account == AccountId(2)).then_some(BackendError::Login)
        });

        let seen = drain(&events);
        assert!(seen.contains(&AgentEvent::Error {
            account: Some(AccountId(2)),
            error: SyncError::LoginFailed,
        }));
        assert!(seen.contains(&AgentEvent::SynchronizingChanged(SyncStatus::Completed)));

        // Account 3's chain really ran.
        assert!(seen.contains(&AgentEvent::FolderRetrievalCompleted(AccountId(3))));
    }

    #[test]
    fn test_disk_full_halts_run() {
        let (mut agent, mock, events, store) = setup();
        ready(&mut agent);
        for account in [1u64, 2, 3] {
            store.add_account(
                AccountId(account),
                FolderId(account * 10),
                vec![FolderId(account * 10)],
            );
        }

        agent.accounts_sync(
            vec![AccountId(1), AccountId(2), AccountId(3)],
            false,
            20,
        );
        drive_run(&mut agent, &mock, |account| {
            (account == AccountId(2)).then_some(BackendError::DiskFull)
        });

        let seen = drain(&events);
        assert!(seen.contains(&AgentEvent::SynchronizingChanged(SyncStatus::Error)));
        assert!(!seen.contains(&AgentEvent::FolderRetrievalCompleted(AccountId(3))));
        assert!(!agent.synchronizing());
    }

    #[test]
    fn test_offline_pauses_sync_and_online_resumes_same_account() {
        let (mut agent, mock, _events, store) = setup();
        ready(&mut agent);
        store.add_account(AccountId(1), FolderId(10), vec![FolderId(10)]);

        agent.synchronize(AccountId(1));
        let id = mock.last_started(Lane::Retrieval).unwrap();

        agent.set_online(false);
        assert_eq!(mock.cancels(), vec![Lane::Retrieval]);

        // The backend confirms the cancellation; the run must not advance.
        mock.fail(Lane::Retrieval, id, BackendError::Cancelled);
        agent.drain_backend();
        assert!(agent.synchronizing());
        assert_eq!(agent.current_synchronizing_account(), Some(AccountId(1)));
        assert_eq!(mock.starts().len(), 1);

        // Back online: the folder list is re-issued for the same account.
        agent.set_online(true);
        assert_eq!(mock.starts().len(), 2);
        assert_eq!(agent.current_synchronizing_account(), Some(AccountId(1)));

        drive_run(&mut agent, &mock, |_| None);
        assert!(!agent.synchronizing());
    }

    #[test]
    fn test_storage_actions_dispatch_while_offline() {
        let (mut agent, mock, _events, _store) = setup();
        ready(&mut agent);
        agent.set_online(false);

        agent.retrieve_message_list(AccountId(1), FolderId(10), 20);
        agent.delete_messages(vec![MessageId(5)]);

        let lanes: Vec<Lane> = mock.starts().iter().map(|(lane, _)| *lane).collect();
        assert_eq!(lanes, vec![Lane::Storage]);

        agent.set_online(true);
        let lanes: Vec<Lane> = mock.starts().iter().map(|(lane, _)| *lane).collect();
        assert_eq!(lanes, vec![Lane::Storage, Lane::Retrieval]);
    }

    #[test]
    fn test_cancel_sync_then_fresh_run_resets_progress() {
        let (mut agent, mock, events, store) = setup();
        ready(&mut agent);
        store.add_account(AccountId(1), FolderId(10), vec![FolderId(10)]);
        store.add_account(AccountId(2), FolderId(20), vec![FolderId(20)]);

        agent.accounts_sync(vec![AccountId(1), AccountId(2)], false, 20);
        let id = mock.last_started(Lane::Retrieval).unwrap();
        mock.succeed(Lane::Retrieval, id);
        agent.drain_backend();
        let id = mock.last_started(Lane::Retrieval).unwrap();
        mock.progress(Lane::Retrieval, id, 5, 10);
        agent.drain_backend();

        agent.cancel_sync();
        assert!(!agent.synchronizing());
        mock.fail(Lane::Retrieval, id, BackendError::Cancelled);
        agent.drain_backend();
        drain(&events);

        agent.accounts_sync(vec![AccountId(1), AccountId(2)], false, 20);
        let seen = drain(&events);
        assert!(seen.contains(&AgentEvent::ProgressUpdated(0)));
        assert!(seen.contains(&AgentEvent::SynchronizingChanged(SyncStatus::Synchronizing)));

        drive_run(&mut agent, &mock, |_| None);
        let seen = drain(&events);
        assert!(seen.contains(&AgentEvent::ProgressUpdated(100)));
        assert!(seen.contains(&AgentEvent::SynchronizingChanged(SyncStatus::Completed)));
    }

    #[test]
    fn test_progress_events_are_monotonic() {
        let (mut agent, mock, events, store) = setup();
        ready(&mut agent);
        store.add_account(AccountId(1), FolderId(10), vec![FolderId(10), FolderId(11)]);
        store.add_account(AccountId(2), FolderId(20), vec![FolderId(20)]);

        agent.accounts_sync(vec![AccountId(1), AccountId(2)], false, 20);

        let mut guard = 0;
        while agent.synchronizing() {
            guard += 1;
            assert!(guard < 100);
            if let Some((id, lane)) = agent
                .current_action(Lane::Retrieval)
                .map(|a| (a.id(), a.lane()))
            {
                mock.progress(lane, id, 1, 2);
                agent.drain_backend();
                mock.progress(lane, id, 2, 2);
                mock.succeed(lane, id);
                agent.drain_backend();
            } else if let Some(action) = agent.current_action(Lane::Transmit) {
                let (id, lane) = (action.id(), action.lane());
                mock.succeed(lane, id);
                agent.drain_backend();
            }
        }

        let percents: Vec<u8> = drain(&events)
            .into_iter()
            .filter_map(|e| match e {
                AgentEvent::ProgressUpdated(p) => Some(p),
                _ => None,
            })
            .collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(percents.last(), Some(&100));
    }

    #[test]
    fn test_cancel_all_drops_pending_and_drains_current() {
        let (mut agent, mock, _events, _store) = setup();
        ready(&mut agent);

        let first = agent.retrieve_message_list(AccountId(1), FolderId(10), 20);
        agent.retrieve_message_list(AccountId(1), FolderId(11), 20);
        agent.delete_messages(vec![MessageId(5)]);

        agent.cancel_all();
        // Network lanes are cancelled at the backend, the storage mutation
        // completes on its own.
        assert_eq!(mock.cancels(), vec![Lane::Retrieval]);
        assert_eq!(agent.status().pending_actions, 0);

        // While draining, nothing new dispatches.
        let late = agent.retrieve_message_list(AccountId(2), FolderId(20), 20);
        assert_eq!(mock.starts().len(), 2);

        mock.fail(Lane::Retrieval, first, BackendError::Cancelled);
        let storage = mock.last_started(Lane::Storage).unwrap();
        mock.succeed(Lane::Storage, storage);
        agent.drain_backend();

        // Drained: the late request dispatches now.
        assert_eq!(mock.last_started(Lane::Retrieval), Some(late));
    }

    #[test]
    fn test_cancelled_action_reports_no_error() {
        let (mut agent, mock, events, _store) = setup();
        ready(&mut agent);

        let id = agent.retrieve_message_list(AccountId(1), FolderId(10), 20);
        mock.fail(Lane::Retrieval, id, BackendError::Cancelled);
        agent.drain_backend();

        assert!(!drain(&events)
            .iter()
            .any(|e| matches!(e, AgentEvent::Error { .. })));
    }

    #[test]
    fn test_removed_message_drops_tracked_download() {
        let (mut agent, mock, _events, _store) = setup();
        ready(&mut agent);
        let location = AttachmentLocation::new(MessageId(1), "2");

        agent.download_attachment(location.clone());
        let id = mock.last_started(Lane::Retrieval).unwrap();
        mock.fail(Lane::Retrieval, id, BackendError::Network);
        agent.drain_backend();
        assert_eq!(agent.attachment_status(&location), AttachmentStatus::Failed);

        agent.handle_store_event(StoreEvent::MessagesRemoved(vec![MessageId(1)]));
        assert_eq!(
            agent.attachment_status(&location),
            AttachmentStatus::NotDownloaded
        );
    }

    #[test]
    fn test_send_requires_outbox_messages() {
        let (mut agent, mock, _events, store) = setup();
        ready(&mut agent);
        store.add_account(AccountId(1), FolderId(10), vec![FolderId(10)]);

        agent.send_messages(AccountId(1));
        assert!(mock.starts().is_empty());

        store.set_outbox_pending(AccountId(1), true);
        agent.send_messages(AccountId(1));
        assert_eq!(mock.starts().len(), 1);
    }

    #[test]
    fn test_removed_account_is_pruned_from_run() {
        let (mut agent, mock, _events, store) = setup();
        ready(&mut agent);
        store.add_account(AccountId(1), FolderId(10), vec![FolderId(10)]);
        store.add_account(AccountId(2), FolderId(20), vec![FolderId(20)]);

        agent.accounts_sync(vec![AccountId(1), AccountId(2)], false, 20);
        store.remove_account(AccountId(1));
        agent.handle_store_event(StoreEvent::AccountsRemoved(vec![AccountId(1)]));

        // The run moved on; the removed account's in-flight folder list
        // still drains its terminal without advancing anything.
        assert_eq!(agent.current_synchronizing_account(), Some(AccountId(2)));
        drive_run(&mut agent, &mock, |_| None);
        assert!(!agent.synchronizing());
    }

    #[test]
    fn test_rejected_start_reports_failure() {
        let (mut agent, mock, events, _store) = setup();
        ready(&mut agent);
        mock.set_fail_start(true);

        agent.retrieve_message_list(AccountId(1), FolderId(10), 20);
        assert!(drain(&events).contains(&AgentEvent::Error {
            account: Some(AccountId(1)),
            error: SyncError::SyncFailed,
        }));

        // The lane is free again for later work.
        mock.set_fail_start(false);
        agent.retrieve_message_list(AccountId(1), FolderId(11), 20);
        assert_eq!(mock.starts().len(), 1);
    }

    #[test]
    fn test_error_attribution_via_store_lookup() {
        let (mut agent, mock, events, store) = setup();
        ready(&mut agent);
        store.add_message(MessageId(5), AccountId(3));

        agent.delete_messages(vec![MessageId(5)]);
        let id = mock.last_started(Lane::Storage).unwrap();
        mock.fail(Lane::Storage, id, BackendError::Network);
        agent.drain_backend();

        assert!(drain(&events).contains(&AgentEvent::Error {
            account: Some(AccountId(3)),
            error: SyncError::SyncFailed,
        }));
    }

    #[tokio::test]
    async fn test_spawned_agent_processes_requests() {
        let (executor, mock, backend_rx) = MockExecutor::new();
        let store = Arc::new(MemoryStore::new());
        store.add_account(AccountId(1), FolderId(10), vec![FolderId(10)]);
        let (handle, events, _join) = Agent::spawn(
            Box::new(executor),
            backend_rx,
            store,
            AgentConfig::default(),
        );

        handle.set_backend_ready(true).unwrap();
        handle
            .retrieve_folder_list(AccountId(1), None, true)
            .unwrap();

        let started = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Some(id) = mock.last_started(Lane::Retrieval) {
                    return id;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        mock.succeed(Lane::Retrieval, started);

        let account = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match events.recv_async().await {
                    Ok(AgentEvent::FolderRetrievalCompleted(account)) => return account,
                    Ok(_) => continue,
                    Err(_) => panic!("event channel closed"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(account, AccountId(1));

        handle.shutdown().unwrap();
    }
}
