use anyhow::{Result, bail};
use serde::Serialize;

use basket_core::controller::{Controller, Phase, SignUp};
use basket_core::models::{AccountStatus, AppState, Role, UserProfile};

use super::helpers::{money, require_signed_in, session_err};

#[derive(Serialize)]
struct StatusView<'a> {
    signed_in: bool,
    phase: Phase,
    email: &'a str,
    name: &'a str,
    account_status: AccountStatus,
    role: Role,
    cloud_sync: bool,
    receipts: usize,
    chat_messages: usize,
    monthly_budget: f64,
    current_spend: f64,
    pending_push: bool,
}

fn status_view(ctl: &Controller) -> StatusView<'_> {
    let AppState {
        profile,
        history,
        chat_history,
        is_cloud_enabled,
        ..
    } = ctl.state();
    StatusView {
        signed_in: profile.has_identity(),
        phase: ctl.phase(),
        email: &profile.email,
        name: &profile.name,
        account_status: profile.account_status,
        role: profile.role,
        cloud_sync: *is_cloud_enabled,
        receipts: history.len(),
        chat_messages: chat_history.len(),
        monthly_budget: profile.monthly_budget,
        current_spend: profile.current_spend,
        pending_push: ctl.has_pending_push(),
    }
}

fn print_profile(profile: &UserProfile) {
    println!("  Name:       {}", profile.name);
    println!("  Email:      {}", profile.email);
    println!("  Account:    {:?} ({:?})", profile.account_status, profile.role);
    println!("  Budget:     {} / month", money(profile.monthly_budget));
    println!("  Spent:      {} this month", money(profile.current_spend));
    println!("  Diet:       {}", profile.dietary_regime);
    if !profile.family_context.is_empty() {
        println!("  Household:  {}", profile.family_context);
    }
    if !profile.goals.is_empty() {
        println!("  Goals:      {}", profile.goals);
    }
    println!("  Categories: {}", profile.custom_categories.join(", "));
}

pub(crate) async fn cmd_signup(ctl: &mut Controller, form: SignUp, json: bool) -> Result<()> {
    ctl.sign_up(form).await.map_err(session_err)?;
    let profile = &ctl.state().profile;
    if json {
        println!("{}", serde_json::to_string_pretty(profile)?);
    } else {
        println!("Welcome, {}! Account created for {}", profile.name, profile.email);
        print_profile(profile);
    }
    Ok(())
}

pub(crate) async fn cmd_signin(ctl: &mut Controller, email: &str, json: bool) -> Result<()> {
    ctl.sign_in(email).await.map_err(session_err)?;
    let state = ctl.state();
    if json {
        println!("{}", serde_json::to_string_pretty(&status_view(ctl))?);
    } else {
        println!(
            "Signed in as {} ({} receipts)",
            state.profile.email,
            state.history.len()
        );
    }
    Ok(())
}

pub(crate) fn cmd_logout(ctl: &mut Controller) -> Result<()> {
    let email = ctl.state().profile.email.clone();
    ctl.logout()?;
    if email.is_empty() {
        println!("Local data cleared");
    } else {
        println!("Signed out {email}; local data cleared");
    }
    Ok(())
}

pub(crate) fn cmd_status(ctl: &Controller, json: bool) -> Result<()> {
    let view = status_view(ctl);
    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }
    if !view.signed_in {
        println!("Not signed in");
        return Ok(());
    }
    println!("Signed in as {} <{}>", view.name, view.email);
    println!("  Receipts:   {}", view.receipts);
    println!(
        "  Budget:     {} spent of {}",
        money(view.current_spend),
        money(view.monthly_budget)
    );
    println!(
        "  Cloud sync: {}",
        if view.cloud_sync { "on" } else { "off" }
    );
    Ok(())
}

pub(crate) fn cmd_profile_show(ctl: &Controller, json: bool) -> Result<()> {
    require_signed_in(ctl)?;
    let profile = &ctl.state().profile;
    if json {
        println!("{}", serde_json::to_string_pretty(profile)?);
    } else {
        print_profile(profile);
    }
    Ok(())
}

/// Optional replacements for the settings form.
#[derive(Default)]
pub(crate) struct ProfileEdit {
    pub name: Option<String>,
    pub budget: Option<f64>,
    pub diet: Option<String>,
    pub family: Option<String>,
    pub goals: Option<String>,
    pub categories: Option<Vec<String>>,
}

impl ProfileEdit {
    fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.budget.is_none()
            && self.diet.is_none()
            && self.family.is_none()
            && self.goals.is_none()
            && self.categories.is_none()
    }

    fn apply(self, mut profile: UserProfile) -> UserProfile {
        if let Some(name) = self.name {
            profile.name = name;
        }
        if let Some(budget) = self.budget {
            profile.monthly_budget = budget;
        }
        if let Some(diet) = self.diet {
            profile.dietary_regime = diet;
        }
        if let Some(family) = self.family {
            profile.family_context = family;
        }
        if let Some(goals) = self.goals {
            profile.goals = goals;
        }
        if let Some(categories) = self.categories {
            profile.custom_categories = categories;
        }
        profile
    }
}

pub(crate) fn cmd_profile_set(ctl: &mut Controller, edit: ProfileEdit, json: bool) -> Result<()> {
    require_signed_in(ctl)?;
    if edit.is_empty() {
        bail!("Nothing to change. Pass at least one of --name, --budget, --diet, --family, --goals, --categories");
    }
    if edit.budget.is_some_and(|b| !b.is_finite() || b < 0.0) {
        bail!("Budget must be 0 or more");
    }
    let profile = edit.apply(ctl.state().profile.clone());
    ctl.update_profile(profile).map_err(session_err)?;

    let profile = &ctl.state().profile;
    if json {
        println!("{}", serde_json::to_string_pretty(profile)?);
    } else {
        println!("Profile updated");
        print_profile(profile);
    }
    Ok(())
}

pub(crate) fn cmd_cloud(ctl: &mut Controller, enabled: bool) -> Result<()> {
    require_signed_in(ctl)?;
    ctl.set_cloud_enabled(enabled);
    if enabled {
        println!("Cloud sync on");
    } else {
        println!("Cloud sync off; changes stay on this device");
    }
    Ok(())
}
