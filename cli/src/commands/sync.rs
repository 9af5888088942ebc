use anyhow::Result;
use tabled::{Table, Tabled, settings::Style};

use basket_core::controller::Controller;

use super::helpers::{ExitStatus, money, require_signed_in, session_err};

pub(crate) async fn cmd_sync_push(ctl: &mut Controller) -> Result<()> {
    require_signed_in(ctl)?;
    if !ctl.state().is_cloud_enabled {
        eprintln!("Cloud sync is off. Use `basket cloud on` to enable it.");
        return Err(ExitStatus(2).into());
    }
    if ctl.flush().await? {
        println!("Pushed local changes");
    } else {
        println!("Nothing to push");
    }
    Ok(())
}

pub(crate) async fn cmd_sync_pull(ctl: &mut Controller) -> Result<()> {
    require_signed_in(ctl)?;
    ctl.refresh().await.map_err(session_err)?;
    println!(
        "Pulled {} ({} receipts)",
        ctl.state().profile.email,
        ctl.state().history.len()
    );
    Ok(())
}

pub(crate) async fn cmd_admin_users(ctl: &mut Controller, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct UserRow {
        #[tabled(rename = "Email")]
        email: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Status")]
        status: String,
        #[tabled(rename = "Role")]
        role: String,
        #[tabled(rename = "Budget")]
        budget: String,
        #[tabled(rename = "Joined")]
        joined: String,
    }

    require_signed_in(ctl)?;
    let profiles = ctl.admin_profiles().await.map_err(session_err)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&profiles)?);
        return Ok(());
    }
    if profiles.is_empty() {
        eprintln!("No accounts found");
        return Err(ExitStatus(2).into());
    }

    let rows: Vec<UserRow> = profiles
        .iter()
        .map(|p| UserRow {
            email: p.email.clone(),
            name: p.name.clone(),
            status: format!("{:?}", p.account_status).to_lowercase(),
            role: format!("{:?}", p.role).to_lowercase(),
            budget: money(p.monthly_budget),
            joined: p.joined_at.chars().take(10).collect(),
        })
        .collect();

    let table = Table::new(&rows).with(Style::rounded()).to_string();
    println!("{table}");
    Ok(())
}
