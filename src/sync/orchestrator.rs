//! Multi-account synchronization runs
//!
//! One run walks an ordered list of accounts. For each account the
//! orchestrator drives a retrieval chain (folder list, then one message list
//! per folder, then an export of local changes) and blends the chain position
//! with live backend progress into a single monotonically non-decreasing
//! percentage. The orchestrator owns only the run state; it returns
//! [`SyncCommand`]s for the agent to apply, and reads the mail store to
//! enumerate folders and outbox state.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::action::ActionKind;
use crate::store::MailStore;
use crate::types::{AccountId, FolderId, StandardFolder, SyncError, SyncStatus};

/// Instruction for the agent, produced by orchestrator state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCommand {
    /// Enqueue an action on the agent's queue (dedup applies as usual).
    Enqueue(ActionKind),
    /// Drop pending retrieval-chain actions of an abandoned account.
    DropPending(AccountId),
    /// Broadcast a sync status transition.
    Status(SyncStatus),
    /// Broadcast the account currently synchronizing.
    CurrentAccount(Option<AccountId>),
    /// Broadcast an updated progress percentage.
    Progress(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    FolderList,
    MessageLists,
    ExportUpdates,
}

#[derive(Debug)]
struct SyncRun {
    accounts: Vec<AccountId>,
    index: usize,
    sync_only_inbox: bool,
    minimum: u32,
    phase: Phase,
    /// Folders of the current account whose message list has not completed.
    pending_folders: Vec<FolderId>,
    steps_done: u32,
    steps_total: u32,
    /// Backend progress of the step currently executing, 0..=1.
    step_progress: f32,
    /// Highest percentage reported so far; keeps the broadcast monotonic.
    reported: u8,
}

impl SyncRun {
    fn current_account(&self) -> AccountId {
        self.accounts[self.index]
    }

    fn percent(&self) -> u8 {
        let total = self.accounts.len() as f32;
        let fraction = ((self.steps_done as f32 + self.step_progress)
            / self.steps_total.max(1) as f32)
            .min(1.0);
        let raw = (self.index as f32 + fraction) / total * 100.0;
        raw.min(100.0) as u8
    }

    /// Returns a new percentage to report, if it moved forward.
    fn report(&mut self) -> Option<u8> {
        let percent = self.percent();
        if percent > self.reported {
            self.reported = percent;
            Some(percent)
        } else {
            None
        }
    }

    fn enter_account(&mut self) {
        self.phase = Phase::FolderList;
        self.pending_folders.clear();
        self.steps_done = 0;
        // Folder list, at least one message list, export. Corrected once the
        // folder list has completed and the real folder count is known.
        self.steps_total = 3;
        self.step_progress = 0.0;
    }
}

/// Sequences sync runs over a set of accounts.
pub struct SyncOrchestrator {
    store: Arc<dyn MailStore>,
    run: Option<SyncRun>,
}

impl SyncOrchestrator {
    pub fn new(store: Arc<dyn MailStore>) -> Self {
        Self { store, run: None }
    }

    pub fn is_active(&self) -> bool {
        self.run.is_some()
    }

    pub fn current_account(&self) -> Option<AccountId> {
        self.run.as_ref().map(|run| run.current_account())
    }

    /// Progress reported so far, 0 while idle.
    pub fn reported_percent(&self) -> u8 {
        self.run.as_ref().map(|run| run.reported).unwrap_or(0)
    }

    /// Start a run over `accounts`. Rejected (empty command list) while a
    /// run is active; `cancel` first to restart.
    pub fn begin(
        &mut self,
        accounts: Vec<AccountId>,
        sync_only_inbox: bool,
        minimum: u32,
    ) -> Vec<SyncCommand> {
        if self.run.is_some() {
            warn!("sync already in progress, request rejected");
            return Vec::new();
        }

        if accounts.is_empty() {
            debug!("accounts sync requested with no accounts");
            return vec![
                SyncCommand::Status(SyncStatus::Synchronizing),
                SyncCommand::Status(SyncStatus::Completed),
            ];
        }

        info!(
            "starting sync of {} account(s), inbox only: {}",
            accounts.len(),
            sync_only_inbox
        );

        let first = accounts[0];
        let mut run = SyncRun {
            accounts,
            index: 0,
            sync_only_inbox,
            minimum,
            phase: Phase::FolderList,
            pending_folders: Vec::new(),
            steps_done: 0,
            steps_total: 3,
            step_progress: 0.0,
            reported: 0,
        };
        run.enter_account();
        self.run = Some(run);

        vec![
            SyncCommand::Status(SyncStatus::Synchronizing),
            SyncCommand::Progress(0),
            SyncCommand::CurrentAccount(Some(first)),
            SyncCommand::Enqueue(ActionKind::RetrieveFolderList {
                account: first,
                folder: None,
                descending: true,
            }),
        ]
    }

    /// React to the successful terminal of an action. Actions that are not
    /// part of the current account's chain are ignored.
    pub fn on_action_completed(&mut self, kind: &ActionKind) -> Vec<SyncCommand> {
        let mut account_done = false;
        let mut cmds = Vec::new();

        {
            let Some(run) = self.run.as_mut() else {
                return cmds;
            };
            let account = run.current_account();

            match (run.phase, kind) {
                (Phase::FolderList, ActionKind::RetrieveFolderList { account: a, .. })
                    if *a == account =>
                {
                    run.steps_done = 1;
                    run.step_progress = 0.0;

                    let folders: Vec<FolderId> = if run.sync_only_inbox {
                        self.store
                            .standard_folder(account, StandardFolder::Inbox)
                            .into_iter()
                            .collect()
                    } else {
                        self.store.synchronizable_folders(account)
                    };

                    run.steps_total = folders.len() as u32 + 2;
                    run.pending_folders = folders.clone();

                    if folders.is_empty() {
                        debug!("account {} has no folders to sync", account);
                        run.phase = Phase::ExportUpdates;
                        cmds.push(SyncCommand::Enqueue(ActionKind::ExportUpdates { account }));
                    } else {
                        run.phase = Phase::MessageLists;
                        for folder in folders {
                            cmds.push(SyncCommand::Enqueue(ActionKind::RetrieveMessageList {
                                account,
                                folder,
                                minimum: run.minimum,
                            }));
                        }
                    }

                    if let Some(percent) = run.report() {
                        cmds.push(SyncCommand::Progress(percent));
                    }
                }
                (Phase::MessageLists, ActionKind::RetrieveMessageList { account: a, folder, .. })
                    if *a == account =>
                {
                    run.pending_folders.retain(|f| f != folder);
                    run.steps_done += 1;
                    run.step_progress = 0.0;

                    if run.pending_folders.is_empty() {
                        run.phase = Phase::ExportUpdates;
                        cmds.push(SyncCommand::Enqueue(ActionKind::ExportUpdates { account }));
                        if self.store.has_messages_in_outbox(account) {
                            cmds.push(SyncCommand::Enqueue(ActionKind::Send { account }));
                        }
                    }

                    if let Some(percent) = run.report() {
                        cmds.push(SyncCommand::Progress(percent));
                    }
                }
                (Phase::ExportUpdates, ActionKind::ExportUpdates { account: a })
                    if *a == account =>
                {
                    run.steps_done += 1;
                    account_done = true;
                }
                _ => {}
            }
        }

        if account_done {
            cmds.extend(self.advance_account());
        }
        cmds
    }

    /// React to a classified failure of an action. Network and login errors
    /// abandon the current account and move on; disk exhaustion aborts the
    /// whole run. Failures of actions outside the chain are ignored.
    pub fn on_action_failed(&mut self, kind: &ActionKind, error: SyncError) -> Vec<SyncCommand> {
        let Some(run) = self.run.as_ref() else {
            return Vec::new();
        };
        let account = run.current_account();
        if !chain_action(kind, account) {
            return Vec::new();
        }

        match error {
            SyncError::DiskFull => {
                warn!("sync aborted, disk full while syncing account {}", account);
                self.run = None;
                vec![
                    SyncCommand::DropPending(account),
                    SyncCommand::CurrentAccount(None),
                    SyncCommand::Status(SyncStatus::Error),
                ]
            }
            SyncError::SyncFailed | SyncError::LoginFailed => {
                info!(
                    "abandoning sync of account {} after {:?}, moving on",
                    account, error
                );
                let mut cmds = vec![SyncCommand::DropPending(account)];
                cmds.extend(self.advance_account());
                cmds
            }
        }
    }

    /// Blend live backend progress of the current chain step into the run
    /// percentage. Returns a new percentage to report, if any.
    pub fn on_progress(&mut self, kind: &ActionKind, value: u32, total: u32) -> Option<u8> {
        let run = self.run.as_mut()?;
        if !chain_action(kind, run.current_account()) {
            return None;
        }
        if total > 0 {
            run.step_progress = (value as f32 / total as f32).min(1.0);
        }
        run.report()
    }

    /// Re-issue the outstanding steps of the current account, used when
    /// connectivity returns after offline cancellation. Queue dedup swallows
    /// steps that are still pending.
    pub fn resume(&self) -> Vec<SyncCommand> {
        let Some(run) = self.run.as_ref() else {
            return Vec::new();
        };
        let account = run.current_account();
        match run.phase {
            Phase::FolderList => vec![SyncCommand::Enqueue(ActionKind::RetrieveFolderList {
                account,
                folder: None,
                descending: true,
            })],
            Phase::MessageLists => run
                .pending_folders
                .iter()
                .map(|folder| {
                    SyncCommand::Enqueue(ActionKind::RetrieveMessageList {
                        account,
                        folder: *folder,
                        minimum: run.minimum,
                    })
                })
                .collect(),
            Phase::ExportUpdates => vec![SyncCommand::Enqueue(ActionKind::ExportUpdates {
                account,
            })],
        }
    }

    /// Abort the run without reporting completion progress. The next `begin`
    /// starts over from zero.
    pub fn cancel(&mut self) -> Vec<SyncCommand> {
        let Some(run) = self.run.take() else {
            return Vec::new();
        };
        info!("sync cancelled at account {}", run.current_account());
        vec![
            SyncCommand::DropPending(run.current_account()),
            SyncCommand::CurrentAccount(None),
            SyncCommand::Status(SyncStatus::Completed),
        ]
    }

    /// Prune removed accounts from the run. A removed current account is
    /// abandoned like a failed one, minus the error report.
    pub fn remove_accounts(&mut self, removed: &[AccountId]) -> Vec<SyncCommand> {
        let current = {
            let Some(run) = self.run.as_mut() else {
                return Vec::new();
            };
            let current = run.current_account();
            let tail: Vec<AccountId> = run
                .accounts
                .split_off(run.index + 1)
                .into_iter()
                .filter(|a| !removed.contains(a))
                .collect();
            run.accounts.extend(tail);
            current
        };

        if removed.contains(&current) {
            let mut cmds = vec![SyncCommand::DropPending(current)];
            cmds.extend(self.advance_account());
            cmds
        } else {
            Vec::new()
        }
    }

    fn advance_account(&mut self) -> Vec<SyncCommand> {
        let Some(run) = self.run.as_mut() else {
            return Vec::new();
        };

        run.index += 1;
        if run.index >= run.accounts.len() {
            info!("sync run completed over {} account(s)", run.accounts.len());
            self.run = None;
            return vec![
                SyncCommand::Progress(100),
                SyncCommand::CurrentAccount(None),
                SyncCommand::Status(SyncStatus::Completed),
            ];
        }

        run.enter_account();
        let account = run.current_account();
        let mut cmds = Vec::new();
        if let Some(percent) = run.report() {
            cmds.push(SyncCommand::Progress(percent));
        }
        cmds.push(SyncCommand::CurrentAccount(Some(account)));
        cmds.push(SyncCommand::Enqueue(ActionKind::RetrieveFolderList {
            account,
            folder: None,
            descending: true,
        }));
        cmds
    }
}

/// Whether `kind` is a retrieval-chain step of `account`.
pub(crate) fn chain_action(kind: &ActionKind, account: AccountId) -> bool {
    match kind {
        ActionKind::RetrieveFolderList { account: a, .. }
        | ActionKind::RetrieveMessageList { account: a, .. }
        | ActionKind::ExportUpdates { account: a } => *a == account,
        _ => false,
    }
}
