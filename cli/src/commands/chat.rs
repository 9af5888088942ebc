use anyhow::Result;

use basket_core::controller::Controller;
use basket_core::extract::Coach;
use basket_core::models::ChatRole;

use super::helpers::{ExitStatus, require_signed_in, session_err};

pub(crate) async fn cmd_chat(
    ctl: &mut Controller,
    coach: &dyn Coach,
    message: &str,
    json: bool,
) -> Result<()> {
    require_signed_in(ctl)?;
    if message.trim().is_empty() {
        anyhow::bail!("Message is empty");
    }
    let reply = ctl.send_chat(coach, message).await.map_err(session_err)?;
    if json {
        println!("{}", serde_json::json!({ "reply": reply }));
    } else {
        println!("{reply}");
    }
    Ok(())
}

pub(crate) fn cmd_chat_log(ctl: &Controller, json: bool) -> Result<()> {
    require_signed_in(ctl)?;
    let chat = &ctl.state().chat_history;
    if json {
        println!("{}", serde_json::to_string_pretty(chat)?);
        return Ok(());
    }
    if chat.is_empty() {
        eprintln!("No conversation yet. Use `basket chat ask <message>` to ask the coach.");
        return Err(ExitStatus(2).into());
    }
    for message in chat {
        let who = match message.role {
            ChatRole::User => "you",
            ChatRole::Model => "coach",
        };
        println!("{who:>5}: {}", message.text);
    }
    Ok(())
}
