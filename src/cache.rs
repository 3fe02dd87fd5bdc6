use crate::error::Error;
use crate::error::Result;
use crate::flight::Fetched;
use crate::flight::Flight;
use crate::flight::FlightSender;
use crate::model::Model;
use crate::op::UpdateDescriptor;
use crate::traits::PersistenceAdapter;
use crate::types::Document;
use crate::types::Pending;
use crate::types::Query;
use crate::types::Slot;
use fieldx_plus::fx_plus;
use moka::ops::compute::Op;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use std::collections::hash_map;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tracing::instrument;
use tracing::trace;
use tracing::warn;

enum Lookup {
    Ready(Arc<Model>),
    Joined(Flight),
    Launched(FlightSender, Flight),
}

enum Claim {
    Ready(Arc<Model>),
    Joined(Flight),
    Claimed,
}

struct FlightPlan {
    flight: u64,
    ids:    Vec<String>,
    // A single-id plan goes through find_one, a batch through find_by_ids.
    batch:  bool,
}

/// The cache for one named collection of records.
///
/// Reads are served from memory whenever possible. A miss starts exactly one fetch for the identifier, no matter how
/// many callers ask for it in the meantime; they all get what that fetch returns. Updates are written through: the
/// descriptor goes to the persistence adapter first and, if the record is cached, is then replayed against the cached
/// copy so the two never drift apart without another round trip.
///
/// ```ignore
/// let users = DataCollection::builder()
///     .name("users")
///     .adapter(adapter)
///     .max_capacity(50_000)
///     .build()?;
///
/// let user = users.require_by_id(&user_id).await?;
/// users
///     .apply_op_by_id(user.id(), &UpdateDescriptor::new().add("teamIds", team_id)?)
///     .await?;
/// ```
///
/// Only resolved models live in the underlying [moka](https://crates.io/crates/moka) cache, where capacity and idle
/// eviction may drop them at any time. Outstanding fetches are tracked next to it, out of the eviction policy's
/// reach, so an identifier never has more than one fetch in flight. Every state change happens under the lock of the
/// outstanding fetches map, with cached models replaced in a synchronous compute step of the cache; nothing is locked
/// across an await. Each change takes a fresh stamp from a per-collection counter. A fetch result is installed only
/// when its pending record still carries the original stamp and no update of the identifier is on its way to the
/// store. Otherwise the fetched snapshot may or may not contain that update, so it is left out and the next read goes
/// to the store again.
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`DataCollection`].", "", "See [`DataCollection::builder()`] method."),
        method_doc("Implement builder pattern for [`DataCollection`]."),
    )
)]
pub struct DataCollection<A>
where
    A: PersistenceAdapter,
{
    #[fieldx(builder(required, into), get(clone))]
    adapter: Arc<A>,

    /// Collection name, like `users` or `streams`. Used in errors and traces.
    #[fieldx(get, builder(required, into))]
    name: String,

    #[fieldx(get(copy), default(10_000))]
    max_capacity: u64,

    /// Evict models that were neither read nor updated for this long.
    #[fieldx(get(copy), default(None))]
    time_to_idle: Option<Duration>,

    #[fieldx(vis(pub(crate)), lazy, clearer(private), get(clone), builder(off))]
    slots: Arc<Cache<String, Slot>>,

    #[fieldx(get(off), builder(off), default(AtomicU64::new(1)))]
    versions: AtomicU64,

    // Outstanding fetches by identifier.
    #[fieldx(private, inner_mut, get, get_mut, builder(off), default(HashMap::new()))]
    flights: HashMap<String, Pending>,

    // Identifiers with updates sent to the store but not yet mirrored, and how many of them.
    #[fieldx(private, inner_mut, get, get_mut, builder(off), default(HashMap::new()))]
    writes: HashMap<String, usize>,
}

// An update of `id` on its way to the store. Dropping an unfinished ticket, e.g. when the caller gives up, just
// forgets about the write.
struct WriteTicket<'a, A>
where
    A: PersistenceAdapter,
{
    collection: &'a DataCollection<A>,
    id:         &'a str,
    done:       bool,
}

impl<A> WriteTicket<'_, A>
where
    A: PersistenceAdapter,
{
    fn complete(&mut self) {
        if !self.done {
            self.done = true;
            self.collection.end_write(self.id);
        }
    }
}

impl<A> Drop for WriteTicket<'_, A>
where
    A: PersistenceAdapter,
{
    fn drop(&mut self) {
        self.complete();
    }
}

impl<A> DataCollection<A>
where
    A: PersistenceAdapter,
{
    fn build_slots(&self) -> Arc<Cache<String, Slot>> {
        let mut builder = Cache::builder()
            .max_capacity(self.max_capacity())
            .name(self.name())
            .eviction_policy(EvictionPolicy::tiny_lfu());
        if let Some(idle) = self.time_to_idle() {
            builder = builder.time_to_idle(idle);
        }
        Arc::new(builder.build())
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::Relaxed)
    }

    fn begin_write<'a>(&'a self, id: &'a str) -> WriteTicket<'a, A> {
        *self.writes_mut().entry(id.to_string()).or_insert(0) += 1;
        WriteTicket {
            collection: self,
            id,
            done: false,
        }
    }

    fn end_write(&self, id: &str) {
        let mut writes = self.writes_mut();
        if let Some(count) = writes.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                writes.remove(id);
            }
        }
    }

    fn models_of(&self, records: Vec<Document>) -> Result<HashMap<String, Arc<Model>>> {
        records
            .into_iter()
            .map(|record| {
                let model = Model::from_record(self.name(), record)?;
                Ok((model.id().to_string(), Arc::new(model)))
            })
            .collect()
    }

    // Resolves `id` against the cache and the outstanding fetches, registering `flight` for it if it is cold.
    fn claim(&self, flights: &mut HashMap<String, Pending>, id: &str, flight: &Flight) -> Claim {
        // A fetch may have been settled while the caller was waiting for the lock.
        if let Some(slot) = self.slots().get(id) {
            return Claim::Ready(slot.model);
        }
        match flights.entry(id.to_string()) {
            hash_map::Entry::Occupied(pending) => Claim::Joined(pending.get().flight.clone()),
            hash_map::Entry::Vacant(vacant) => {
                vacant.insert(Pending {
                    flight:  flight.clone(),
                    version: flight.id(),
                });
                Claim::Claimed
            }
        }
    }

    fn lookup(&self, id: &str) -> Lookup {
        if let Some(slot) = self.slots().get(id) {
            return Lookup::Ready(slot.model);
        }

        let (sender, flight) = Flight::launch(self.next_version());
        let claim = self.claim(&mut self.flights_mut(), id, &flight);
        match claim {
            Claim::Ready(model) => Lookup::Ready(model),
            Claim::Joined(flight) => Lookup::Joined(flight),
            Claim::Claimed => Lookup::Launched(sender, flight),
        }
    }

    // Moves the stamp of an outstanding fetch of `id` forward so that its result is not installed.
    fn outdate(&self, flights: &mut HashMap<String, Pending>, id: &str) {
        if let Some(pending) = flights.get_mut(id) {
            pending.version = self.next_version();
        }
    }

    async fn dispatch(&self, sender: FlightSender, plan: FlightPlan) {
        // Run the fetch on its own task so that a caller giving up doesn't strand everybody else waiting for it.
        if let Some(myself) = self.myself() {
            tokio::spawn(async move {
                let outcome = myself.fly(plan).await;
                sender.land(outcome);
            });
        }
        else {
            let outcome = self.fly(plan).await;
            sender.land(outcome);
        }
    }

    async fn fly(&self, plan: FlightPlan) -> Result<Fetched> {
        debug!(collection = %self.name(), flight = plan.flight, ids = ?plan.ids, "fetching");

        let records = if plan.batch {
            self.adapter().find_by_ids(&plan.ids).await
        }
        else {
            self.adapter()
                .find_one(&Query::by_id(plan.ids[0].clone()))
                .await
                .map(|found| found.into_iter().collect())
        };

        match records.map_err(Error::adapter).and_then(|records| self.models_of(records)) {
            Ok(models) => {
                for id in &plan.ids {
                    self.settle(id, plan.flight, models.get(id).cloned());
                }
                Ok(Arc::new(models))
            }
            Err(err) => {
                debug!(collection = %self.name(), flight = plan.flight, error = %err, "fetch failed");
                for id in &plan.ids {
                    self.settle(id, plan.flight, None);
                }
                Err(err)
            }
        }
    }

    // Ends the fetch `flight` of `id`. The fetched model is installed only if nothing could have changed the record
    // behind the snapshot's back: no update or eviction landed while the fetch was out and no update is still on its
    // way to the store.
    fn settle(&self, id: &str, flight: u64, model: Option<Arc<Model>>) {
        let mut flights = self.flights_mut();
        let stale = match flights.get(id) {
            Some(pending) if pending.flight.id() == flight => pending.is_stale(),
            _ => return,
        };
        flights.remove(id);

        match model {
            Some(model) if !stale && !self.writes().contains_key(id) => {
                let version = self.next_version();
                self.slots()
                    .entry(id.to_string())
                    .and_compute_with(|entry| match entry {
                        // Created in the meantime; that copy is at least as fresh.
                        Some(_) => Op::Nop,
                        None => Op::Put(Slot { version, model }),
                    });
            }
            Some(_) => trace!(collection = %self.name(), id, "fetched snapshot is stale, leaving it out"),
            None => (),
        }
    }

    async fn wait(&self, ids: &[String], flight: Flight) -> Result<Fetched> {
        let flight_id = flight.id();
        match flight.landed().await {
            Some(outcome) => outcome,
            None => {
                for id in ids {
                    self.settle(id, flight_id, None);
                }
                Err(Error::FetchAborted {
                    collection: self.name().clone(),
                    id:         ids.join(","),
                })
            }
        }
    }

    // Replays `update` against the cached copy of the ticket's identifier, if there is one.
    fn mirror(&self, mut ticket: WriteTicket<'_, A>, update: &UpdateDescriptor) -> Result<()> {
        let id = ticket.id;
        let mut failure = None;
        {
            let mut flights = self.flights_mut();
            // Must happen under the same lock as the replay, or a fetch could install a snapshot already containing
            // the update right before it is applied once more.
            ticket.complete();
            // Whatever the outstanding fetch brings back may predate this update.
            self.outdate(&mut flights, id);

            self.slots()
                .entry(id.to_string())
                .and_compute_with(|entry| match entry.map(|e| e.into_value()) {
                    Some(slot) => match slot.model.applied(update) {
                        Ok(updated) => Op::Put(Slot {
                            version: self.next_version(),
                            model:   Arc::new(updated),
                        }),
                        Err(err) => {
                            failure = Some(err);
                            Op::Remove
                        }
                    },
                    None => Op::Nop,
                });
        }

        match failure {
            None => Ok(()),
            Some(err) => {
                warn!(collection = %self.name(), id, error = %err, "store updated but cached copy could not follow; evicted");
                Err(Error::CacheConsistency {
                    collection: self.name().clone(),
                    id:         id.to_string(),
                    source:     Box::new(err),
                })
            }
        }
    }

    fn prefer_cached(&self, model: Model) -> Arc<Model> {
        self.cached(model.id()).unwrap_or_else(|| Arc::new(model))
    }

    /// The model for `id`, from memory or from the store. `Ok(None)` if the store has no such record.
    #[instrument(level = "trace", skip(self), fields(collection = %self.name()))]
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Arc<Model>>> {
        let flight = match self.lookup(id) {
            Lookup::Ready(model) => {
                trace!("cache hit");
                return Ok(Some(model));
            }
            Lookup::Joined(flight) => {
                trace!(flight = flight.id(), "joining outstanding fetch");
                flight
            }
            Lookup::Launched(sender, flight) => {
                let plan = FlightPlan {
                    flight: flight.id(),
                    ids:    vec![id.to_string()],
                    batch:  false,
                };
                self.dispatch(sender, plan).await;
                flight
            }
        };

        let fetched = self.wait(&[id.to_string()], flight).await?;
        Ok(fetched.get(id).cloned())
    }

    /// Same as [`get_by_id`](Self::get_by_id) but a missing record is an [`Error::NotFound`].
    pub async fn require_by_id(&self, id: &str) -> Result<Arc<Model>> {
        self.get_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found(self.name(), id))
    }

    /// Models for `ids`, in the same order, `None` where the store has no record. Everything not in memory and not
    /// already being fetched is loaded with a single `find_by_ids` call.
    #[instrument(level = "trace", skip(self, ids), fields(collection = %self.name(), count = ids.len()))]
    pub async fn get_by_ids<S>(&self, ids: &[S]) -> Result<Vec<Option<Arc<Model>>>>
    where
        S: AsRef<str>,
    {
        let mut resolved: HashMap<String, Arc<Model>> = HashMap::new();
        let mut joined: HashMap<u64, (Flight, Vec<String>)> = HashMap::new();
        let mut missing = Vec::new();
        let mut requested = HashSet::new();

        let (sender, batch) = Flight::launch(self.next_version());

        {
            let mut flights = self.flights_mut();
            for id in ids.iter().map(AsRef::as_ref) {
                if !requested.insert(id) {
                    continue;
                }
                match self.claim(&mut flights, id, &batch) {
                    Claim::Ready(model) => {
                        resolved.insert(id.to_string(), model);
                    }
                    Claim::Joined(flight) => match joined.entry(flight.id()) {
                        hash_map::Entry::Occupied(mut waiting) => waiting.get_mut().1.push(id.to_string()),
                        hash_map::Entry::Vacant(slot) => {
                            slot.insert((flight, vec![id.to_string()]));
                        }
                    },
                    Claim::Claimed => missing.push(id.to_string()),
                }
            }
        }

        if !missing.is_empty() {
            trace!(missing = missing.len(), joined = joined.len(), "batch fetch");
            let plan = FlightPlan {
                flight: batch.id(),
                ids:    missing.clone(),
                batch:  true,
            };
            self.dispatch(sender, plan).await;
            joined.insert(batch.id(), (batch, missing));
        }

        for (_, (flight, waiting_ids)) in joined {
            let fetched = self.wait(&waiting_ids, flight).await?;
            for id in waiting_ids {
                if let Some(model) = fetched.get(&id) {
                    resolved.insert(id, model.clone());
                }
            }
        }

        Ok(ids.iter().map(|id| resolved.get(id.as_ref()).cloned()).collect())
    }

    /// Writes `update` through to the store, then replays it against the cached copy of `id`, if any.
    ///
    /// When the record is cached the update is tried against the cached copy first; operator and type errors are
    /// reported without touching the store. If the store accepts the update but the cached copy can't follow (the
    /// store and the operator engine disagree), the copy is evicted and [`Error::CacheConsistency`] is returned: the
    /// write did happen, see [`Error::is_committed`].
    #[instrument(level = "trace", skip(self, update), fields(collection = %self.name(), update = %update))]
    pub async fn apply_op_by_id(&self, id: &str, update: &UpdateDescriptor) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }

        if let Some(cached) = self.cached(id) {
            cached.applied(update)?;
        }

        let ticket = self.begin_write(id);
        if !self.adapter().update(id, update).await.map_err(Error::adapter)? {
            drop(ticket);
            self.evict(id);
            return Err(Error::not_found(self.name(), id));
        }

        self.mirror(ticket, update)
    }

    /// Sets every attribute of `attributes` at the top level of the record.
    pub async fn update_by_id(&self, id: &str, attributes: Document) -> Result<()> {
        self.apply_op_by_id(id, &UpdateDescriptor::set_attributes(attributes)?)
            .await
    }

    /// Persists a new record and caches it under the identifier the store assigned.
    #[instrument(level = "trace", skip(self, attributes), fields(collection = %self.name()))]
    pub async fn create(&self, attributes: Document) -> Result<Arc<Model>> {
        let record = self.adapter().create(attributes).await.map_err(Error::adapter)?;
        let model = Arc::new(Model::from_record(self.name(), record)?);
        trace!(id = model.id(), "created");
        self.slots().insert(
            model.id().to_string(),
            Slot {
                version: self.next_version(),
                model:   model.clone(),
            },
        );
        Ok(model)
    }

    #[instrument(level = "trace", skip(self), fields(collection = %self.name()))]
    pub async fn delete_by_id(&self, id: &str) -> Result<()> {
        let deleted = self.adapter().delete(id).await.map_err(Error::adapter)?;
        self.evict(id);
        if deleted {
            Ok(())
        }
        else {
            Err(Error::not_found(self.name(), id))
        }
    }

    /// First record matching `query`. A by-id query goes through [`get_by_id`](Self::get_by_id).
    pub async fn get_one_by_query(&self, query: &Query) -> Result<Option<Arc<Model>>> {
        if let Some(id) = query.id() {
            return self.get_by_id(id).await;
        }
        let record = self.adapter().find_one(query).await.map_err(Error::adapter)?;
        Ok(match record {
            Some(record) => Some(self.prefer_cached(Model::from_record(self.name(), record)?)),
            None => None,
        })
    }

    /// Records matching `query`, in the order the store returned them. Results already in memory are returned as
    /// cached; the others are not cached, since nothing orders them against updates landing concurrently.
    pub async fn get_by_query(&self, query: &Query) -> Result<Vec<Arc<Model>>> {
        let records = self.adapter().find(query).await.map_err(Error::adapter)?;
        records
            .into_iter()
            .map(|record| Ok(self.prefer_cached(Model::from_record(self.name(), record)?)))
            .collect()
    }

    /// The cached model for `id` without going to the store.
    pub fn cached(&self, id: &str) -> Option<Arc<Model>> {
        self.slots().get(id).map(|slot| slot.model)
    }

    pub fn is_cached(&self, id: &str) -> bool {
        self.slots().contains_key(id)
    }

    /// `true` while a fetch for `id` is outstanding.
    pub fn is_pending(&self, id: &str) -> bool {
        self.flights().contains_key(id)
    }

    /// Stamp of the cached model of `id`, or of its outstanding fetch. It grows with every fetch, update or creation
    /// affecting the identifier.
    pub fn version_of(&self, id: &str) -> Option<u64> {
        self.slots()
            .get(id)
            .map(|slot| slot.version)
            .or_else(|| self.flights().get(id).map(|pending| pending.version))
    }

    /// Drops the cached model of `id`. A fetch of `id` still in flight completes for its waiters but its result is not
    /// cached.
    pub fn evict(&self, id: &str) {
        let mut flights = self.flights_mut();
        self.outdate(&mut flights, id);
        self.slots().invalidate(id);
    }

    pub fn clear(&self) {
        let mut flights = self.flights_mut();
        for pending in flights.values_mut() {
            pending.version = self.next_version();
        }
        self.slots().invalidate_all();
    }

    /// Approximate number of cached models, see [`moka::sync::Cache::entry_count`].
    pub fn entry_count(&self) -> u64 {
        self.slots().entry_count()
    }

    /// Applies capacity and idle evictions the cache otherwise performs lazily.
    pub fn run_pending_tasks(&self) {
        self.slots().run_pending_tasks();
    }

    /// Drops the whole cache; it is recreated empty on next use.
    pub fn close(&self) {
        self.clear();
        self.clear_slots();
    }
}
