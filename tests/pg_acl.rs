#![cfg(feature = "pg-tests")]

use palisade::{
    AclCache, AclError, AclProvider, AclProviderOptions, GrantingStrategy, InMemoryAclCache,
    MaskGrantingStrategy, MutableAclProvider, ObjectIdentity, PostgresAclProvider,
    SecurityIdentity,
};
use sqlx::Connection;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

static MIGRATOR: Migrator = sqlx::migrate!();
static SCHEMA_SEQ: AtomicU64 = AtomicU64::new(0);

fn base_url() -> Option<String> {
    std::env::var("PALISADE_TEST_DATABASE_URL")
        .or_else(|_| std::env::var("PALISADE_DATABASE_URL"))
        .or_else(|_| std::env::var("DATABASE_URL"))
        .ok()
}

fn url_with_schema(base_url: &str, schema: &str) -> String {
    let encoded = format!("-csearch_path%3D{schema}");
    if base_url.contains('?') {
        format!("{base_url}&options={encoded}")
    } else {
        format!("{base_url}?options={encoded}")
    }
}

/// One isolated schema per test: created, migrated, and left behind for
/// post-mortem inspection. Tests skip gracefully when no database is
/// reachable.
async fn test_pool() -> Option<sqlx::PgPool> {
    let base = match base_url() {
        Some(url) => url,
        None => {
            eprintln!("skipping pg-tests: set PALISADE_TEST_DATABASE_URL or DATABASE_URL");
            return None;
        }
    };
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = SCHEMA_SEQ.fetch_add(1, Ordering::Relaxed);
    let schema = format!("palisade_test_{}_{}_{}", std::process::id(), nanos, seq);

    let mut conn = match sqlx::PgConnection::connect(&base).await {
        Ok(conn) => conn,
        Err(err) => {
            eprintln!("skipping pg-tests: cannot connect to postgres: {err}");
            return None;
        }
    };
    let create_sql = format!(r#"CREATE SCHEMA IF NOT EXISTS "{schema}""#);
    if let Err(err) = sqlx::query(&create_sql).execute(&mut conn).await {
        eprintln!("skipping pg-tests: cannot create schema: {err}");
        return None;
    }
    conn.close().await.ok();

    let url = url_with_schema(&base, &schema);
    let pool = match PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&url)
        .await
    {
        Ok(pool) => pool,
        Err(err) => {
            eprintln!("skipping pg-tests: cannot connect pool: {err}");
            return None;
        }
    };
    if let Err(err) = MIGRATOR.run(&pool).await {
        eprintln!("skipping pg-tests: cannot run migrations: {err}");
        return None;
    }
    Some(pool)
}

fn provider_with(pool: &sqlx::PgPool, cache: Option<Arc<dyn AclCache>>) -> PostgresAclProvider {
    PostgresAclProvider::new(
        pool.clone(),
        AclProviderOptions::default(),
        Arc::new(MaskGrantingStrategy::new()),
        cache,
    )
}

async fn pg_provider() -> Option<(PostgresAclProvider, sqlx::PgPool)> {
    let pool = test_pool().await?;
    let provider = provider_with(&pool, None);
    Some((provider, pool))
}

fn blog_post(identifier: &str) -> ObjectIdentity {
    ObjectIdentity::new("BlogPost", identifier)
}

fn role(name: &str) -> SecurityIdentity {
    SecurityIdentity::role(name)
}

#[tokio::test]
async fn pg_create_acl_yields_empty_inheriting_acl() {
    let Some((provider, _pool)) = pg_provider().await else {
        return;
    };

    let oid = blog_post("42");
    let acl = provider.create_acl(&oid).await.expect("create acl");
    assert_eq!(acl.object_identity(), oid);
    assert!(acl.is_entries_inheriting());
    assert!(acl.parent_acl().is_none());
    assert!(acl.class_aces().is_empty());
    assert!(acl.object_aces().is_empty());

    // Referential identity within one provider.
    let again = provider.find_acl(&oid, &[]).await.expect("find acl");
    assert!(again.ptr_eq(&acl));

    let err = provider.create_acl(&oid).await.expect_err("duplicate");
    assert!(matches!(err, AclError::AclAlreadyExists(_)));
}

#[tokio::test]
async fn pg_find_acls_returns_every_requested_identity() {
    let Some((provider, _pool)) = pg_provider().await else {
        return;
    };

    let oids = vec![blog_post("1"), blog_post("2"), blog_post("1")];
    provider.create_acl(&oids[0]).await.expect("create");
    provider.create_acl(&oids[1]).await.expect("create");

    let acls = provider.find_acls(&oids, &[]).await.expect("find acls");
    assert_eq!(acls.len(), 2);
    for oid in &oids {
        let acl = acls.get(oid).expect("requested identity present");
        assert_eq!(acl.object_identity(), *oid);
    }
}

#[tokio::test]
async fn pg_persist_and_reload_round_trip() {
    let Some((provider, pool)) = pg_provider().await else {
        return;
    };

    let oid = blog_post("42");
    let acl = provider.create_acl(&oid).await.expect("create acl");
    acl.insert_class_ace(0, role("ROLE_USER"), 1, true, GrantingStrategy::All)
        .expect("class ace");
    acl.insert_object_ace(0, role("ROLE_USER"), 1, false, GrantingStrategy::All)
        .expect("object ace");
    acl.insert_object_field_ace(0, "title", role("ROLE_EDITOR"), 2, true, GrantingStrategy::Any)
        .expect("object field ace");
    provider.update_acl(&acl).await.expect("update");
    acl.update_object_auditing(0, true, true).expect("auditing");
    provider.update_acl(&acl).await.expect("update auditing");

    let fresh = provider_with(&pool, None);
    let reloaded = fresh.find_acl(&oid, &[]).await.expect("reload");
    assert!(reloaded.is_entries_inheriting());
    assert!(reloaded.parent_acl().is_none());

    let class_aces = reloaded.class_aces();
    assert_eq!(class_aces.len(), 1);
    assert_eq!(class_aces[0].mask(), 1);
    assert!(class_aces[0].is_granting());
    assert_eq!(class_aces[0].strategy(), GrantingStrategy::All);
    assert_eq!(class_aces[0].security_identity(), role("ROLE_USER"));

    let object_aces = reloaded.object_aces();
    assert_eq!(object_aces.len(), 1);
    assert!(!object_aces[0].is_granting());
    assert!(object_aces[0].is_audit_success());
    assert!(object_aces[0].is_audit_failure());

    let field_aces = reloaded.object_field_aces("title");
    assert_eq!(field_aces.len(), 1);
    assert_eq!(field_aces[0].mask(), 2);
    assert_eq!(field_aces[0].strategy(), GrantingStrategy::Any);
    assert_eq!(field_aces[0].field().as_deref(), Some("title"));

    // The object-scope deny decides before the class-scope grant.
    assert!(!reloaded
        .is_granted(&[1], &[role("ROLE_USER")], true)
        .expect("deny"));
    assert!(reloaded
        .is_field_granted("title", &[2], &[role("ROLE_EDITOR")], true)
        .expect("field grant"));
}

#[tokio::test]
async fn pg_class_aces_share_instances_across_same_type_acls() {
    let Some((provider, pool)) = pg_provider().await else {
        return;
    };

    let x = blog_post("x");
    let y = blog_post("y");
    let acl_x = provider.create_acl(&x).await.expect("create x");
    provider.create_acl(&y).await.expect("create y");
    acl_x
        .insert_class_ace(0, role("ROLE_USER"), 1, true, GrantingStrategy::All)
        .expect("class ace");
    provider.update_acl(&acl_x).await.expect("update");

    let fresh = provider_with(&pool, None);
    let acls = fresh
        .find_acls(&[x.clone(), y.clone()], &[])
        .await
        .expect("find both");
    let x_aces = acls[&x].class_aces();
    let y_aces = acls[&y].class_aces();
    assert_eq!(x_aces.len(), 1);
    assert_eq!(y_aces.len(), 1);
    // One storage id, one instance.
    assert!(x_aces[0].ptr_eq(&y_aces[0]));
}

#[tokio::test]
async fn pg_inheritance_follows_parent_until_disabled() {
    let Some((provider, pool)) = pg_provider().await else {
        return;
    };

    let parent_oid = blog_post("parent");
    let child_oid = blog_post("child");
    let parent = provider.create_acl(&parent_oid).await.expect("parent");
    let child = provider.create_acl(&child_oid).await.expect("child");

    parent
        .insert_class_ace(0, role("R"), 1, true, GrantingStrategy::All)
        .expect("class ace");
    provider.update_acl(&parent).await.expect("update parent");
    child.set_parent_acl(Some(parent.clone()));
    provider.update_acl(&child).await.expect("update child");

    let fresh = provider_with(&pool, None);
    let reloaded = fresh.find_acl(&child_oid, &[]).await.expect("reload child");
    assert!(reloaded.parent_acl().is_some());
    assert!(reloaded.is_granted(&[1], &[role("R")], true).expect("inherited"));

    reloaded.set_entries_inheriting(false);
    fresh.update_acl(&reloaded).await.expect("persist flag");

    let fresh2 = provider_with(&pool, None);
    let reloaded2 = fresh2.find_acl(&child_oid, &[]).await.expect("reload again");
    assert!(!reloaded2.is_entries_inheriting());
    assert!(matches!(
        reloaded2.is_granted(&[1], &[role("R")], true),
        Err(AclError::NoApplicableAce)
    ));
}

#[tokio::test]
async fn pg_ancestor_closure_matches_parent_chain() {
    let Some((provider, pool)) = pg_provider().await else {
        return;
    };

    let a = provider.create_acl(&blog_post("a")).await.expect("a");
    let b = provider.create_acl(&blog_post("b")).await.expect("b");
    let c = provider.create_acl(&blog_post("c")).await.expect("c");
    b.set_parent_acl(Some(a.clone()));
    provider.update_acl(&b).await.expect("link b");
    c.set_parent_acl(Some(b.clone()));
    provider.update_acl(&c).await.expect("link c");

    let rows: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT object_identity_id, ancestor_id FROM acl_object_identity_ancestors \
         ORDER BY object_identity_id, ancestor_id",
    )
    .fetch_all(&pool)
    .await
    .expect("closure rows");
    let mut expected = vec![
        (a.id(), a.id()),
        (b.id(), b.id()),
        (b.id(), a.id()),
        (c.id(), c.id()),
        (c.id(), b.id()),
        (c.id(), a.id()),
    ];
    expected.sort_unstable();
    let mut actual = rows.clone();
    actual.sort_unstable();
    assert_eq!(actual, expected);

    // Reparenting c directly under a rewrites c's closure rows.
    c.set_parent_acl(Some(a.clone()));
    provider.update_acl(&c).await.expect("reparent c");
    let c_rows: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT object_identity_id, ancestor_id FROM acl_object_identity_ancestors \
         WHERE object_identity_id = $1",
    )
    .bind(c.id())
    .fetch_all(&pool)
    .await
    .expect("c closure rows");
    let mut c_actual = c_rows.clone();
    c_actual.sort_unstable();
    let mut c_expected = vec![(c.id(), c.id()), (c.id(), a.id())];
    c_expected.sort_unstable();
    assert_eq!(c_actual, c_expected);

    let direct = provider
        .find_children(&blog_post("a"), true)
        .await
        .expect("direct children");
    assert_eq!(direct.len(), 2);
    let transitive = provider
        .find_children(&blog_post("a"), false)
        .await
        .expect("transitive children");
    assert_eq!(transitive.len(), 2);
}

#[tokio::test]
async fn pg_find_acls_reports_partial_results() {
    let Some((provider, _pool)) = pg_provider().await else {
        return;
    };

    provider.create_acl(&blog_post("42")).await.expect("42");
    provider.create_acl(&blog_post("43")).await.expect("43");

    let request = vec![
        blog_post("42"),
        blog_post("43"),
        ObjectIdentity::new("Comment", "7"),
    ];
    let err = provider
        .find_acls(&request, &[])
        .await
        .expect_err("missing comment");
    match err {
        AclError::NotAllAclsFound { partial, missing } => {
            assert_eq!(partial.len(), 2);
            assert!(partial.contains_key(&blog_post("42")));
            assert!(partial.contains_key(&blog_post("43")));
            assert_eq!(missing, vec![ObjectIdentity::new("Comment", "7")]);
        }
        other => panic!("expected NotAllAclsFound, got {other:?}"),
    }

    let err = provider
        .find_acl(&ObjectIdentity::new("Comment", "7"), &[])
        .await
        .expect_err("single missing");
    assert!(matches!(err, AclError::AclNotFound(_)));
}

#[tokio::test]
async fn pg_concurrent_class_modification_is_detected() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let provider_a = provider_with(&pool, None);
    let provider_b = provider_with(&pool, None);

    let x = blog_post("x");
    let y = blog_post("y");
    let a_x = provider_a.create_acl(&x).await.expect("create x");
    provider_a.create_acl(&y).await.expect("create y");

    // B loads y before A commits a class-scope change.
    let b_y = provider_b.find_acl(&y, &[]).await.expect("b loads y");

    a_x.insert_class_ace(0, role("ROLE_USER"), 1, true, GrantingStrategy::All)
        .expect("class ace");
    provider_a.update_acl(&a_x).await.expect("a commits");

    // B now loads x fresh; its stale y diverges from x's class scope.
    provider_b.find_acl(&x, &[]).await.expect("b loads x");
    b_y.insert_class_ace(0, role("ROLE_ADMIN"), 2, true, GrantingStrategy::All)
        .expect("b class ace");
    let err = provider_b.update_acl(&b_y).await.expect_err("conflict");
    assert!(matches!(err, AclError::ConcurrentModification(_)));
}

#[tokio::test]
async fn pg_reordering_entries_survives_reload() {
    let Some((provider, pool)) = pg_provider().await else {
        return;
    };

    let oid = blog_post("42");
    let acl = provider.create_acl(&oid).await.expect("create");
    for (index, mask) in [1, 2, 4].into_iter().enumerate() {
        acl.insert_object_ace(index, role("R"), mask, true, GrantingStrategy::Equal)
            .expect("insert");
    }
    provider.update_acl(&acl).await.expect("initial update");

    // Shift everything right, then drop the middle of the old run.
    acl.insert_object_ace(0, role("R"), 8, true, GrantingStrategy::Equal)
        .expect("insert front");
    provider.update_acl(&acl).await.expect("front update");
    acl.delete_object_ace(2).expect("delete middle");
    provider.update_acl(&acl).await.expect("delete update");

    let fresh = provider_with(&pool, None);
    let reloaded = fresh.find_acl(&oid, &[]).await.expect("reload");
    let masks: Vec<i32> = reloaded.object_aces().iter().map(|ace| ace.mask()).collect();
    assert_eq!(masks, vec![8, 1, 4]);
}

#[tokio::test]
async fn pg_cache_serves_subtrees_and_is_evicted_on_update() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let cache: Arc<InMemoryAclCache> = Arc::new(InMemoryAclCache::new());
    let provider = provider_with(&pool, Some(cache.clone()));

    let parent_oid = blog_post("parent");
    let child_oid = blog_post("child");
    let parent = provider.create_acl(&parent_oid).await.expect("parent");
    let child = provider.create_acl(&child_oid).await.expect("child");
    parent
        .insert_object_ace(0, role("R"), 1, true, GrantingStrategy::All)
        .expect("ace");
    provider.update_acl(&parent).await.expect("update parent");
    child.set_parent_acl(Some(parent.clone()));
    provider.update_acl(&child).await.expect("update child");

    // A fresh provider misses its identity map and loads from the
    // database, which repopulates the cache.
    let warmer = provider_with(&pool, Some(cache.clone()));
    warmer.find_acl(&child_oid, &[]).await.expect("warm cache");
    assert!(cache.get_by_identity(&child_oid).is_some());

    // A second provider resolves through the shared cache, parent chain
    // included.
    let other = provider_with(&pool, Some(cache.clone()));
    let from_cache = other.find_acl(&child_oid, &[]).await.expect("cache hit");
    let cached_parent = from_cache.parent_acl().expect("parent preserved");
    assert_eq!(cached_parent.object_identity(), parent_oid);
    assert!(from_cache.is_granted(&[1], &[role("R")], true).expect("decision"));

    // Object-scope updates evict the identity and its descendants.
    parent
        .insert_object_ace(0, role("R"), 2, false, GrantingStrategy::All)
        .expect("deny ace");
    provider.update_acl(&parent).await.expect("update again");
    assert!(cache.get_by_identity(&parent_oid).is_none());
    assert!(cache.get_by_identity(&child_oid).is_none());

    // Class-scope updates clear the whole cache.
    let rewarmer = provider_with(&pool, Some(cache.clone()));
    rewarmer.find_acl(&child_oid, &[]).await.expect("rewarm");
    assert!(!cache.is_empty());
    parent
        .insert_class_ace(0, role("R"), 4, true, GrantingStrategy::All)
        .expect("class ace");
    provider.update_acl(&parent).await.expect("class update");
    assert!(cache.is_empty());
}

#[tokio::test]
async fn pg_delete_acl_removes_subtree() {
    let Some((provider, pool)) = pg_provider().await else {
        return;
    };

    let a = provider.create_acl(&blog_post("a")).await.expect("a");
    let b = provider.create_acl(&blog_post("b")).await.expect("b");
    let c = provider.create_acl(&blog_post("c")).await.expect("c");
    b.set_parent_acl(Some(a.clone()));
    provider.update_acl(&b).await.expect("link b");
    c.set_parent_acl(Some(b.clone()));
    provider.update_acl(&c).await.expect("link c");
    b.insert_object_ace(0, role("R"), 1, true, GrantingStrategy::All)
        .expect("ace");
    provider.update_acl(&b).await.expect("update b");

    provider.delete_acl(&blog_post("a")).await.expect("delete subtree");

    for identifier in ["a", "b", "c"] {
        let err = provider
            .find_acl(&blog_post(identifier), &[])
            .await
            .expect_err("gone");
        assert!(matches!(err, AclError::AclNotFound(_)));
    }
    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM acl_object_identities")
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(remaining, 0);
    let entries: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM acl_entries")
        .fetch_one(&pool)
        .await
        .expect("entries count");
    assert_eq!(entries, 0);

    let err = provider
        .delete_acl(&blog_post("a"))
        .await
        .expect_err("already gone");
    assert!(matches!(err, AclError::AclNotFound(_)));
}

#[tokio::test]
async fn pg_security_identity_maintenance() {
    let Some((provider, pool)) = pg_provider().await else {
        return;
    };

    let oid = blog_post("42");
    let alice = SecurityIdentity::user("AcmeUser", "alice");
    let acl = provider.create_acl(&oid).await.expect("create");
    acl.insert_object_ace(0, alice.clone(), 1, true, GrantingStrategy::All)
        .expect("ace");
    provider.update_acl(&acl).await.expect("update");

    let err = provider
        .update_user_security_identity(&SecurityIdentity::user("AcmeUser", "alice"), "alice")
        .await
        .expect_err("no-op rename");
    assert!(matches!(err, AclError::InvalidArgument(_)));

    provider
        .update_user_security_identity(&SecurityIdentity::user("AcmeUser", "alice2"), "alice")
        .await
        .expect("rename");
    let fresh = provider_with(&pool, None);
    let reloaded = fresh.find_acl(&oid, &[]).await.expect("reload");
    assert_eq!(
        reloaded.object_aces()[0].security_identity(),
        SecurityIdentity::user("AcmeUser", "alice2")
    );

    // Deleting the identity cascades into its entries.
    provider
        .delete_security_identity(&SecurityIdentity::user("AcmeUser", "alice2"))
        .await
        .expect("delete sid");
    let fresh2 = provider_with(&pool, None);
    let reloaded2 = fresh2.find_acl(&oid, &[]).await.expect("reload again");
    assert!(reloaded2.object_aces().is_empty());
}

#[tokio::test]
async fn pg_update_rejects_untracked_acl_and_allows_noop() {
    let Some((provider, pool)) = pg_provider().await else {
        return;
    };

    let oid = blog_post("42");
    let acl = provider.create_acl(&oid).await.expect("create");

    // A provider that never loaded this ACL must reject it.
    let stranger = provider_with(&pool, None);
    let err = stranger.update_acl(&acl).await.expect_err("untracked");
    assert!(matches!(err, AclError::InvalidArgument(_)));

    // No recorded changes, no work.
    provider.update_acl(&acl).await.expect("noop update");
}
