//! Recipe Store: named, reusable pipelines persisted in SQLite.
//!
//! A recipe's steps are written once, at insert time. A trigger rejects any
//! later `UPDATE` of the steps column, so revising a recipe always allocates
//! a new id and leaves every version that cites the old id reproducible.

use crate::data::access::DatasetAccess;
use crate::engine::apply::{ApplyEngine, ApplyOutcome, ApplyRequest};
use crate::error::{RefineryError, Result};
use crate::pipeline::{Pipeline, TransformationStep};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS recipes (
    id           TEXT PRIMARY KEY,
    name         TEXT NOT NULL,
    description  TEXT NOT NULL DEFAULT '',
    steps        TEXT NOT NULL,
    owner        TEXT NOT NULL,
    visibility   TEXT NOT NULL CHECK (visibility IN ('private', 'public')),
    usage_count  INTEGER NOT NULL DEFAULT 0,
    derived_from TEXT,
    created_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS recipes_owner ON recipes (owner);
CREATE INDEX IF NOT EXISTS recipes_created ON recipes (created_at, id);

CREATE TABLE IF NOT EXISTS recipe_tags (
    recipe_id TEXT NOT NULL,
    tag       TEXT NOT NULL,
    PRIMARY KEY (recipe_id, tag)
);

CREATE TABLE IF NOT EXISTS recipe_ratings (
    recipe_id TEXT NOT NULL,
    rater     TEXT NOT NULL,
    score     INTEGER NOT NULL CHECK (score BETWEEN 1 AND 5),
    PRIMARY KEY (recipe_id, rater)
);

CREATE TRIGGER IF NOT EXISTS recipes_steps_frozen
BEFORE UPDATE OF steps ON recipes
BEGIN
    SELECT RAISE(ABORT, 'recipe steps are immutable');
END;
";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Public => "public",
        }
    }
}

impl FromStr for Visibility {
    type Err = RefineryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "private" => Ok(Visibility::Private),
            "public" => Ok(Visibility::Public),
            other => Err(RefineryError::invalid(format!(
                "unknown visibility '{other}' (expected private or public)"
            ))),
        }
    }
}

impl std::fmt::Display for Visibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Average score and number of raters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    pub average: f64,
    pub count: u32,
}

/// A persisted, reusable pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub id: String,
    pub name: String,
    pub description: String,
    pub steps: Vec<TransformationStep>,
    pub owner: String,
    pub visibility: Visibility,
    pub tags: Vec<String>,
    pub usage_count: u64,
    pub rating: Rating,
    /// The recipe this one was revised from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_from: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Recipe {
    /// The recipe's steps bound to `source_version`.
    pub fn pipeline(&self, source_version: &str) -> Pipeline {
        Pipeline::from_steps(source_version, self.steps.clone())
    }

    /// Whether `caller` may read, apply, rate, or fork this recipe.
    pub fn visible_to(&self, caller: &str) -> bool {
        self.visibility == Visibility::Public || self.owner == caller
    }

    fn ensure_visible(&self, caller: &str) -> Result<()> {
        if self.visible_to(caller) {
            Ok(())
        } else {
            Err(RefineryError::authorization(format!(
                "recipe {} is private to {}",
                self.id, self.owner
            )))
        }
    }

    fn ensure_owner(&self, caller: &str) -> Result<()> {
        if self.owner == caller {
            Ok(())
        } else {
            Err(RefineryError::authorization(format!(
                "only {} may modify recipe {}",
                self.owner, self.id
            )))
        }
    }
}

/// Input to [`SqliteRecipeStore::create`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRecipe {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<TransformationStep>,
    pub owner: String,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl NewRecipe {
    pub fn new(
        name: impl Into<String>,
        owner: impl Into<String>,
        steps: Vec<TransformationStep>,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            steps,
            owner: owner.into(),
            visibility: Visibility::Private,
            tags: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn public(mut self) -> Self {
        self.visibility = Visibility::Public;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Metadata changes; `None` leaves a field as it is. Steps are not editable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecipeUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub visibility: Option<Visibility>,
    pub tags: Option<Vec<String>>,
}

/// Which recipes [`SqliteRecipeStore::list`] returns. Criteria combine with AND.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecipeFilter {
    /// Recipes owned by this caller, private and public.
    pub owner: Option<String>,
    pub public_only: bool,
    /// Recipes carrying every one of these tags.
    pub tags: Vec<String>,
}

impl RecipeFilter {
    pub fn owner(owner: impl Into<String>) -> Self {
        Self {
            owner: Some(owner.into()),
            ..Self::default()
        }
    }

    pub fn public() -> Self {
        Self {
            public_only: true,
            ..Self::default()
        }
    }

    pub fn tagged(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecipePage {
    pub items: Vec<Recipe>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
}

/// SQLite-backed recipe store. All statements run on the blocking pool.
#[derive(Clone)]
pub struct SqliteRecipeStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecipeStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| RefineryError::execution("recipe store connection poisoned"))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| RefineryError::execution(format!("recipe store task failed: {e}")))?
    }

    pub async fn create(&self, recipe: NewRecipe) -> Result<String> {
        let id = self.call(move |conn| insert(conn, recipe, None)).await?;
        info!(recipe = %id, "Created recipe");
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<Recipe> {
        let id = id.to_string();
        self.call(move |conn| load(conn, &id)).await
    }

    /// A page of recipes ordered by creation time, then id. Pages start at 1.
    pub async fn list(
        &self,
        filter: &RecipeFilter,
        page: usize,
        per_page: usize,
    ) -> Result<RecipePage> {
        let filter = filter.clone();
        let page = page.max(1);
        let per_page = per_page.max(1);
        self.call(move |conn| {
            let (clause, args) = filter_clause(&filter);
            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM recipes{clause}"),
                params_from_iter(args.iter()),
                |row| row.get(0),
            )?;
            let offset = (page - 1) * per_page;
            let ids = {
                let mut stmt = conn.prepare(&format!(
                    "SELECT id FROM recipes{clause} ORDER BY created_at, id LIMIT {per_page} OFFSET {offset}"
                ))?;
                stmt.query_map(params_from_iter(args.iter()), |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };
            let items = ids
                .iter()
                .map(|id| load(conn, id))
                .collect::<Result<Vec<_>>>()?;
            Ok(RecipePage {
                items,
                total: usize::try_from(total).unwrap_or_default(),
                page,
                per_page,
            })
        })
        .await
    }

    /// Apply the recipe's steps to `target_version` on behalf of `caller`.
    /// The usage count is incremented only when the apply commits.
    pub async fn apply(
        &self,
        engine: &ApplyEngine,
        recipe_id: &str,
        target_version: &str,
        caller: &str,
    ) -> Result<ApplyOutcome> {
        let recipe = self.get(recipe_id).await?;
        recipe.ensure_visible(caller)?;

        let request =
            ApplyRequest::new(recipe.pipeline(target_version), caller).with_recipe(&recipe.id);
        let outcome = engine.execute(request, None).await?;

        let id = recipe.id.clone();
        let updated = self
            .call(move |conn| {
                Ok(conn.execute(
                    "UPDATE recipes SET usage_count = usage_count + 1 WHERE id = ?1",
                    [&id],
                )?)
            })
            .await?;
        if updated == 0 {
            warn!(recipe = %recipe.id, "Recipe deleted while being applied");
        }
        info!(
            recipe = %recipe.id,
            version = %outcome.new_version_id,
            caller,
            "Applied recipe"
        );
        Ok(outcome)
    }

    /// Delete a recipe. Only its owner may do so.
    pub async fn delete(&self, id: &str, caller: &str) -> Result<()> {
        let id = id.to_string();
        let caller = caller.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let recipe = load(&tx, &id)?;
            recipe.ensure_owner(&caller)?;
            tx.execute("DELETE FROM recipe_tags WHERE recipe_id = ?1", [&id])?;
            tx.execute("DELETE FROM recipe_ratings WHERE recipe_id = ?1", [&id])?;
            tx.execute("DELETE FROM recipes WHERE id = ?1", [&id])?;
            tx.commit()?;
            info!(recipe = %id, caller = %caller, "Deleted recipe");
            Ok(())
        })
        .await
    }

    /// Freeze the pipeline that produced `version_id` into a new private recipe.
    pub async fn create_from_version(
        &self,
        access: &dyn DatasetAccess,
        version_id: &str,
        owner: &str,
        name: &str,
    ) -> Result<String> {
        let version = access.get_version(version_id).await?;
        let edge = access.lineage_edge(&version.id).await?.ok_or_else(|| {
            RefineryError::invalid(format!(
                "dataset version {version_id} was imported, not produced by a pipeline"
            ))
        })?;
        let recipe = NewRecipe::new(name, owner, edge.pipeline.steps)
            .with_description(format!("Captured from dataset version {version_id}"));
        let derived_from = edge.pipeline.recipe_id;
        let id = self
            .call(move |conn| insert(conn, recipe, derived_from))
            .await?;
        info!(recipe = %id, version = %version_id, "Created recipe from version");
        Ok(id)
    }

    /// Create a new recipe with `steps`, derived from `id`. The original is
    /// never modified. Anyone who can see a recipe may fork it; forks of
    /// someone else's recipe start out private to the caller.
    pub async fn revise_steps(
        &self,
        id: &str,
        caller: &str,
        steps: Vec<TransformationStep>,
    ) -> Result<String> {
        let original = self.get(id).await?;
        original.ensure_visible(caller)?;
        let visibility = if original.owner == caller {
            original.visibility
        } else {
            Visibility::Private
        };
        let revision = NewRecipe {
            name: original.name,
            description: original.description,
            steps,
            owner: caller.to_string(),
            visibility,
            tags: original.tags,
        };
        let parent = original.id;
        let new_id = self
            .call(move |conn| insert(conn, revision, Some(parent)))
            .await?;
        info!(recipe = %new_id, derived_from = %id, "Revised recipe");
        Ok(new_id)
    }

    /// Change name, description, visibility, or tags. Owner only.
    pub async fn update_metadata(
        &self,
        id: &str,
        caller: &str,
        update: RecipeUpdate,
    ) -> Result<Recipe> {
        let id = id.to_string();
        let caller = caller.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            load(&tx, &id)?.ensure_owner(&caller)?;
            if let Some(name) = &update.name {
                check_name(name)?;
            }
            tx.execute(
                "UPDATE recipes SET name = COALESCE(?2, name), \
                 description = COALESCE(?3, description), \
                 visibility = COALESCE(?4, visibility) WHERE id = ?1",
                params![
                    id,
                    update.name,
                    update.description,
                    update.visibility.map(Visibility::as_str)
                ],
            )?;
            if let Some(tags) = &update.tags {
                tx.execute("DELETE FROM recipe_tags WHERE recipe_id = ?1", [&id])?;
                insert_tags(&tx, &id, tags)?;
            }
            let updated = load(&tx, &id)?;
            tx.commit()?;
            debug!(recipe = %id, "Updated recipe metadata");
            Ok(updated)
        })
        .await
    }

    /// Record `rater`'s score (1 to 5), replacing any earlier score of theirs.
    pub async fn rate(&self, id: &str, rater: &str, score: u8) -> Result<Rating> {
        if !(1..=5).contains(&score) {
            return Err(RefineryError::invalid(format!(
                "rating must be between 1 and 5, got {score}"
            )));
        }
        let id = id.to_string();
        let rater = rater.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            load(&tx, &id)?.ensure_visible(&rater)?;
            tx.execute(
                "INSERT INTO recipe_ratings (recipe_id, rater, score) VALUES (?1, ?2, ?3) \
                 ON CONFLICT (recipe_id, rater) DO UPDATE SET score = excluded.score",
                params![id, rater, i64::from(score)],
            )?;
            let rating = load_rating(&tx, &id)?;
            tx.commit()?;
            Ok(rating)
        })
        .await
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(RefineryError::invalid("recipe name must not be empty"));
    }
    Ok(())
}

fn timestamp(at: DateTime<Utc>) -> String {
    // Fixed precision keeps lexical order equal to chronological order.
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn insert(conn: &mut Connection, recipe: NewRecipe, derived_from: Option<String>) -> Result<String> {
    check_name(&recipe.name)?;
    let mut steps = recipe.steps;
    for (i, step) in steps.iter_mut().enumerate() {
        step.order = i;
    }
    let id = uuid::Uuid::new_v4().to_string();
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO recipes \
         (id, name, description, steps, owner, visibility, usage_count, derived_from, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8)",
        params![
            id,
            recipe.name,
            recipe.description,
            serde_json::to_string(&steps)?,
            recipe.owner,
            recipe.visibility.as_str(),
            derived_from,
            timestamp(Utc::now()),
        ],
    )?;
    insert_tags(&tx, &id, &recipe.tags)?;
    tx.commit()?;
    Ok(id)
}

fn insert_tags(conn: &Connection, id: &str, tags: &[String]) -> Result<()> {
    for tag in tags.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
        conn.execute(
            "INSERT OR IGNORE INTO recipe_tags (recipe_id, tag) VALUES (?1, ?2)",
            params![id, tag],
        )?;
    }
    Ok(())
}

struct RecipeRow {
    name: String,
    description: String,
    steps: String,
    owner: String,
    visibility: String,
    usage_count: i64,
    derived_from: Option<String>,
    created_at: String,
}

fn load(conn: &Connection, id: &str) -> Result<Recipe> {
    let row = conn
        .query_row(
            "SELECT name, description, steps, owner, visibility, usage_count, derived_from, \
             created_at FROM recipes WHERE id = ?1",
            [id],
            |row| {
                Ok(RecipeRow {
                    name: row.get(0)?,
                    description: row.get(1)?,
                    steps: row.get(2)?,
                    owner: row.get(3)?,
                    visibility: row.get(4)?,
                    usage_count: row.get(5)?,
                    derived_from: row.get(6)?,
                    created_at: row.get(7)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| RefineryError::not_found(format!("recipe {id}")))?;

    let tags = {
        let mut stmt =
            conn.prepare("SELECT tag FROM recipe_tags WHERE recipe_id = ?1 ORDER BY tag")?;
        stmt.query_map([id], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?
    };
    let created_at = DateTime::parse_from_rfc3339(&row.created_at)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| RefineryError::execution(format!("recipe {id}: bad timestamp: {e}")))?;

    Ok(Recipe {
        id: id.to_string(),
        name: row.name,
        description: row.description,
        steps: serde_json::from_str(&row.steps)?,
        owner: row.owner,
        visibility: row.visibility.parse()?,
        tags,
        usage_count: u64::try_from(row.usage_count).unwrap_or_default(),
        rating: load_rating(conn, id)?,
        derived_from: row.derived_from,
        created_at,
    })
}

fn load_rating(conn: &Connection, id: &str) -> Result<Rating> {
    let (count, average): (i64, f64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(AVG(score), 0.0) FROM recipe_ratings WHERE recipe_id = ?1",
        [id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(Rating {
        average,
        count: u32::try_from(count).unwrap_or(u32::MAX),
    })
}

/// `WHERE` clause and positional arguments for a filter.
fn filter_clause(filter: &RecipeFilter) -> (String, Vec<String>) {
    let mut clauses = Vec::new();
    let mut args: Vec<String> = Vec::new();
    if let Some(owner) = &filter.owner {
        args.push(owner.clone());
        clauses.push(format!("owner = ?{}", args.len()));
    }
    if filter.public_only {
        clauses.push("visibility = 'public'".to_string());
    }
    let tags: BTreeSet<&str> = filter.tags.iter().map(|t| t.trim()).collect();
    if !tags.is_empty() {
        let mut placeholders = Vec::with_capacity(tags.len());
        for tag in &tags {
            args.push((*tag).to_string());
            placeholders.push(format!("?{}", args.len()));
        }
        clauses.push(format!(
            "(SELECT COUNT(*) FROM recipe_tags t WHERE t.recipe_id = recipes.id \
             AND t.tag IN ({})) = {}",
            placeholders.join(", "),
            tags.len()
        ));
    }
    let clause = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    (clause, args)
}
