//! Directory seeding.
//!
//! Teams, users, and apps are owned by other parts of the platform; the
//! broker only reads them. `tetherd seed` loads a JSON snapshot of them
//! so a standalone broker has someone to serve:
//!
//! ```json
//! {
//!   "users": [{"email": "ops@example.com"}],
//!   "teams": [{"name": "ops", "users": ["ops@example.com"]}],
//!   "apps": [{"name": "web", "teams": ["ops"], "units": [{"name": "web/0", "ip": "10.0.0.4"}]}]
//! }
//! ```

use serde::Deserialize;
use tether_state::{App, StateStore, Team, User};
use tracing::info;

#[derive(Debug, Default, Deserialize)]
pub struct Directory {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub teams: Vec<Team>,
    #[serde(default)]
    pub apps: Vec<App>,
}

impl Directory {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Upsert every record. Existing records with the same key are replaced.
    pub fn apply(&self, store: &StateStore) -> anyhow::Result<()> {
        for user in &self.users {
            store.put_user(user)?;
        }
        for team in &self.teams {
            for email in &team.users {
                if store.get_user(email)?.is_none() {
                    anyhow::bail!("team {} lists unknown user {email}", team.name);
                }
            }
            store.put_team(team)?;
        }
        for app in &self.apps {
            store.put_app(app)?;
        }
        info!(
            users = self.users.len(),
            teams = self.teams.len(),
            apps = self.apps.len(),
            "directory seeded"
        );
        Ok(())
    }
}
