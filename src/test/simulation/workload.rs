use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use fake::faker::internet::en::SafeEmail;
use fake::faker::lorem::en::Sentence;
use fake::faker::lorem::en::Word;
use fake::faker::name::en::FirstName;
use fake::faker::name::en::LastName;
use fake::Fake;
use fieldx::fxstruct;
use rand::Rng;
use serde_json::json;
use serde_json::Value;
use strum::IntoEnumIterator;
use tracing::debug;
use tracing::instrument;

use super::SimRegistry;
use super::POSTS;
use super::STREAMS;
use super::TEAMS;
use super::USERS;
use crate::model::Model;
use crate::op::UpdateDescriptor;
use crate::test::memory::MemoryProvider;
use crate::types::Document;
use crate::types::ID_FIELD;

const THEMES: [&str; 3] = ["light", "dark", "solarized"];

/// Identifiers of everything created before the handlers start.
#[derive(Debug, Clone, Default)]
pub struct Seeded {
    pub users:   Vec<String>,
    pub teams:   Vec<String>,
    pub streams: Vec<String>,
}

impl Seeded {
    /// The share of `list` handler `handler` of `handlers` is allowed to modify.
    pub fn owned(list: &[String], handler: usize, handlers: usize) -> Vec<String> {
        list.iter()
            .enumerate()
            .filter(|(idx, _)| idx % handlers == handler)
            .map(|(_, id)| id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Action {
    ReadUser,
    ReadTeam,
    ReadStream,
    JoinTeam,
    LeaveTeam,
    SetPreferences,
    UnsetTheme,
    Post,
    Retract,
    RenameStream,
    Evict,
}

impl Action {
    fn weight(self) -> u32 {
        match self {
            Action::ReadUser => 30,
            Action::ReadTeam => 12,
            Action::ReadStream => 12,
            Action::JoinTeam => 8,
            Action::LeaveTeam => 6,
            Action::SetPreferences => 8,
            Action::UnsetTheme => 2,
            Action::Post => 12,
            Action::Retract => 3,
            Action::RenameStream => 3,
            Action::Evict => 4,
        }
    }

    pub fn pick() -> Self {
        let total: u32 = Action::iter().map(Action::weight).sum();
        let mut roll = rand::rng().random_range(0..total);
        for action in Action::iter() {
            if roll < action.weight() {
                return action;
            }
            roll -= action.weight();
        }
        Action::ReadUser
    }
}

fn pick(list: &[String]) -> Option<String> {
    if list.is_empty() {
        None
    }
    else {
        Some(list[rand::rng().random_range(0..list.len())].clone())
    }
}

fn strings(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(|v| v.as_str().map(String::from)).collect(),
        _ => Vec::new(),
    }
}

fn document(value: Value) -> Document {
    match value {
        Value::Object(doc) => doc,
        _ => Document::new(),
    }
}

/// Creates the initial users, teams and streams. The caches are emptied afterwards so that the handlers start cold.
pub async fn seed(registry: &SimRegistry, users: u32, teams: u32, streams: u32) -> Result<Seeded> {
    let mut seeded = Seeded::default();

    let team_coll = registry.collection(TEAMS)?;
    for _ in 0..teams {
        let name: String = Word().fake();
        let team = team_coll
            .create(document(json!({ "name": name, "memberIds": [] })))
            .await?;
        seeded.teams.push(team.id().to_string());
    }

    let stream_coll = registry.collection(STREAMS)?;
    for idx in 0..streams as usize {
        let name: String = Word().fake();
        let team_id = &seeded.teams[idx % seeded.teams.len()];
        let stream = stream_coll
            .create(document(json!({
                "name": name,
                "teamId": team_id,
                "postCount": 0,
                "postIds": [],
            })))
            .await?;
        seeded.streams.push(stream.id().to_string());
    }

    let user_coll = registry.collection(USERS)?;
    for _ in 0..users {
        let first: String = FirstName().fake();
        let last: String = LastName().fake();
        let email: String = SafeEmail().fake();
        let user = user_coll
            .create(document(json!({
                "name": format!("{first} {last}"),
                "email": email,
                "teamIds": [],
                "postIds": [],
                "stats": { "posts": 0 },
                "preferences": { "theme": "light", "notifications": { "email": true } },
            })))
            .await?;
        seeded.users.push(user.id().to_string());
    }

    // Posts come into existence later, but the collection should exist for verification even if nobody posts.
    registry.collection(POSTS)?;
    registry.clear();

    Ok(seeded)
}

/// One request handler: a stream of random requests against the shared registry.
///
/// Records a handler modifies are either its own (users, stream names) or changed only with operators that commute
/// (set union of distinct identifiers, increments), so the final state doesn't depend on how handlers interleave.
#[fxstruct(sync, no_new, default(off), builder)]
pub struct Handler {
    #[fieldx(get(copy), builder(required))]
    id: usize,

    #[fieldx(get(copy), builder(required))]
    requests: u32,

    #[fieldx(get(clone), builder(required, into))]
    registry: Arc<SimRegistry>,

    #[fieldx(get(clone), builder(required, into))]
    seeded: Arc<Seeded>,

    #[fieldx(get, builder(required))]
    owned_users: Vec<String>,

    #[fieldx(get, builder(required))]
    owned_streams: Vec<String>,
}

impl Handler {
    #[instrument(level = "debug", skip(self), fields(handler = self.id()))]
    pub async fn run(&self) -> Result<HashMap<Action, u64>> {
        let mut done = HashMap::new();
        for _ in 0..self.requests() {
            let action = Action::pick();
            let performed = self
                .perform(action)
                .await
                .with_context(|| format!("handler #{} failed to {action}", self.id()))?;
            *done.entry(performed).or_insert(0) += 1;
        }
        debug!(requests = self.requests(), "handler finished");
        Ok(done)
    }

    /// Performs `action` or, if this handler has nothing to perform it on, a plain read. Returns what was done.
    pub async fn perform(&self, action: Action) -> Result<Action> {
        let performed = match action {
            Action::ReadUser => self.read_user().await?,
            Action::ReadTeam => self.read_team().await?,
            Action::ReadStream => self.read_stream().await?,
            Action::JoinTeam => self.join_team().await?,
            Action::LeaveTeam => self.leave_team().await?,
            Action::SetPreferences => self.set_preferences().await?,
            Action::UnsetTheme => self.unset_theme().await?,
            Action::Post => self.post().await?,
            Action::Retract => self.retract().await?,
            Action::RenameStream => self.rename_stream().await?,
            Action::Evict => self.evict(),
        };
        if performed {
            Ok(action)
        }
        else {
            self.read_user().await?;
            Ok(Action::ReadUser)
        }
    }

    async fn read_user(&self) -> Result<bool> {
        let Some(user_id) = pick(&self.seeded().users)
        else {
            return Ok(false);
        };
        self.registry().collection(USERS)?.require_by_id(&user_id).await?;
        Ok(true)
    }

    async fn read_team(&self) -> Result<bool> {
        let Some(team_id) = pick(&self.seeded().teams)
        else {
            return Ok(false);
        };
        let team = self.registry().collection(TEAMS)?.require_by_id(&team_id).await?;
        let members = strings(team.get("memberIds"));
        let found = self.registry().collection(USERS)?.get_by_ids(&members).await?;
        if let Some(missing) = found.iter().position(Option::is_none) {
            bail!("team {team_id} lists member {} who doesn't exist", members[missing]);
        }
        Ok(true)
    }

    async fn read_stream(&self) -> Result<bool> {
        let Some(stream_id) = pick(&self.seeded().streams)
        else {
            return Ok(false);
        };
        let stream = self.registry().collection(STREAMS)?.require_by_id(&stream_id).await?;
        // A post may be retracted between the two reads; that's fine.
        let post_ids = strings(stream.get("postIds"));
        self.registry().collection(POSTS)?.get_by_ids(&post_ids).await?;
        Ok(true)
    }

    async fn join_team(&self) -> Result<bool> {
        let (Some(user_id), Some(team_id)) = (pick(self.owned_users()), pick(&self.seeded().teams))
        else {
            return Ok(false);
        };
        let registry = self.registry();
        registry
            .collection(USERS)?
            .apply_op_by_id(&user_id, &UpdateDescriptor::new().add("teamIds", team_id.as_str())?)
            .await?;
        registry
            .collection(TEAMS)?
            .apply_op_by_id(&team_id, &UpdateDescriptor::new().add("memberIds", user_id.as_str())?)
            .await?;
        Ok(true)
    }

    async fn leave_team(&self) -> Result<bool> {
        let Some(user_id) = pick(self.owned_users())
        else {
            return Ok(false);
        };
        let registry = self.registry();
        let users = registry.collection(USERS)?;
        let user = users.require_by_id(&user_id).await?;
        let Some(team_id) = pick(&strings(user.get("teamIds")))
        else {
            return Ok(false);
        };
        users
            .apply_op_by_id(&user_id, &UpdateDescriptor::new().pull("teamIds", team_id.as_str())?)
            .await?;
        registry
            .collection(TEAMS)?
            .apply_op_by_id(&team_id, &UpdateDescriptor::new().pull("memberIds", user_id.as_str())?)
            .await?;
        Ok(true)
    }

    async fn set_preferences(&self) -> Result<bool> {
        let Some(user_id) = pick(self.owned_users())
        else {
            return Ok(false);
        };
        let theme = THEMES[rand::rng().random_range(0..THEMES.len())];
        let by_email = rand::rng().random_bool(0.5);
        let update = UpdateDescriptor::new()
            .set("preferences.theme", theme)?
            .set("preferences.notifications.email", by_email)?;
        self.registry()
            .collection(USERS)?
            .apply_op_by_id(&user_id, &update)
            .await?;
        Ok(true)
    }

    async fn unset_theme(&self) -> Result<bool> {
        let Some(user_id) = pick(self.owned_users())
        else {
            return Ok(false);
        };
        self.registry()
            .collection(USERS)?
            .apply_op_by_id(&user_id, &UpdateDescriptor::new().unset("preferences.theme")?)
            .await?;
        Ok(true)
    }

    async fn post(&self) -> Result<bool> {
        let (Some(user_id), Some(stream_id)) = (pick(self.owned_users()), pick(&self.seeded().streams))
        else {
            return Ok(false);
        };
        let body: String = Sentence(3..12).fake();
        let registry = self.registry();
        let post = registry
            .collection(POSTS)?
            .create(document(json!({ "streamId": stream_id, "authorId": user_id, "body": body })))
            .await?;
        registry
            .collection(STREAMS)?
            .apply_op_by_id(
                &stream_id,
                &UpdateDescriptor::new().inc("postCount", 1)?.add("postIds", post.id())?,
            )
            .await?;
        registry
            .collection(USERS)?
            .apply_op_by_id(
                &user_id,
                &UpdateDescriptor::new().inc("stats.posts", 1)?.push("postIds", post.id())?,
            )
            .await?;
        Ok(true)
    }

    async fn retract(&self) -> Result<bool> {
        let Some(user_id) = pick(self.owned_users())
        else {
            return Ok(false);
        };
        let registry = self.registry();
        let users = registry.collection(USERS)?;
        let posts = registry.collection(POSTS)?;
        let user = users.require_by_id(&user_id).await?;
        let Some(post_id) = pick(&strings(user.get("postIds")))
        else {
            return Ok(false);
        };
        let post = posts.require_by_id(&post_id).await?;
        let Some(stream_id) = post.get("streamId").and_then(Value::as_str)
        else {
            bail!("post {post_id} has no stream");
        };

        registry
            .collection(STREAMS)?
            .apply_op_by_id(
                stream_id,
                &UpdateDescriptor::new().inc("postCount", -1)?.pull("postIds", post_id.as_str())?,
            )
            .await?;
        users
            .apply_op_by_id(
                &user_id,
                &UpdateDescriptor::new().inc("stats.posts", -1)?.pull("postIds", post_id.as_str())?,
            )
            .await?;
        posts.delete_by_id(&post_id).await?;
        Ok(true)
    }

    async fn rename_stream(&self) -> Result<bool> {
        let Some(stream_id) = pick(self.owned_streams())
        else {
            return Ok(false);
        };
        let name: String = Word().fake();
        self.registry()
            .collection(STREAMS)?
            .apply_op_by_id(&stream_id, &UpdateDescriptor::new().set("name", name)?)
            .await?;
        Ok(true)
    }

    fn evict(&self) -> bool {
        let seeded = self.seeded();
        let (collection, candidates) = match rand::rng().random_range(0..4) {
            0 => (USERS, &seeded.users),
            1 => (TEAMS, &seeded.teams),
            2 => (STREAMS, &seeded.streams),
            _ => {
                if let Some(posts) = self.registry().get(POSTS) {
                    posts.clear();
                }
                return true;
            }
        };
        match (self.registry().get(collection), pick(candidates)) {
            (Some(coll), Some(id)) => {
                coll.evict(&id);
                true
            }
            _ => false,
        }
    }
}

/// Compares every collection against its store, first what is cached right now, then a fresh read of everything.
/// Returns the number of records checked.
pub async fn verify(registry: &SimRegistry, provider: &MemoryProvider) -> Result<usize> {
    let mut checked = 0;

    for name in registry.names() {
        let Some(collection) = registry.get(&name)
        else {
            continue;
        };
        let records = provider.adapter(&name).records();

        for record in &records {
            let stored = Model::from_record(&name, record.clone())?;
            if let Some(cached) = collection.cached(stored.id()) {
                if *cached != stored {
                    bail!(
                        "{name}/{}: cached copy {} differs from stored {}",
                        stored.id(),
                        Value::Object(cached.to_record()),
                        Value::Object(record.clone())
                    );
                }
            }
        }

        collection.clear();
        let ids: Vec<String> = records
            .iter()
            .filter_map(|record| record.get(ID_FIELD).and_then(Value::as_str).map(String::from))
            .collect();
        let fresh = collection.get_by_ids(&ids).await?;
        for (record, model) in records.iter().zip(fresh) {
            match model {
                Some(model) if model.to_record() == *record => (),
                Some(model) => bail!("{name}/{}: re-read model differs from the stored record", model.id()),
                None => bail!("{name}: stored record {} could not be read back", Value::Object(record.clone())),
            }
        }

        checked += records.len();
    }

    for stream in provider.adapter(STREAMS).records() {
        let count = stream.get("postCount").and_then(Value::as_i64).unwrap_or_default();
        let listed = strings(stream.get("postIds")).len() as i64;
        if count != listed {
            bail!("stream {:?} counts {count} posts but lists {listed}", stream.get(ID_FIELD));
        }
    }
    for user in provider.adapter(USERS).records() {
        let count = user
            .get("stats")
            .and_then(|stats| stats.get("posts"))
            .and_then(Value::as_i64)
            .unwrap_or_default();
        let listed = strings(user.get("postIds")).len() as i64;
        if count != listed {
            bail!("user {:?} counts {count} posts but lists {listed}", user.get(ID_FIELD));
        }
    }

    Ok(checked)
}
