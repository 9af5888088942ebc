mod account;
mod chat;
mod helpers;
mod insights;
mod receipt;
mod sync;

pub(crate) use account::{
    ProfileEdit, cmd_cloud, cmd_logout, cmd_profile_set, cmd_profile_show, cmd_signin,
    cmd_signup, cmd_status,
};
pub(crate) use chat::{cmd_chat, cmd_chat_log};
pub(crate) use helpers::ExitStatus;
pub(crate) use insights::{cmd_export_csv, cmd_insights};
pub(crate) use receipt::{ReceiptEdit, cmd_add, cmd_edit, cmd_history, cmd_scan, cmd_show};
pub(crate) use sync::{cmd_admin_users, cmd_sync_pull, cmd_sync_push};
