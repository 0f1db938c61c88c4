//! Engine tests against the in-memory store.
//!
//! Fixture tenancy: root(1) -> a(2), root(1) -> b(4).
//! `demo1` (ds 5) belongs to tenant a on CDN 1; `demo2` (ds 6) to tenant b on CDN 2.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use edgepurge_auth::{AuthTarget, Principal, Role, TenantDirectory, TenantNode};
    use edgepurge_core::{
        CdnId, DeliveryServiceId, DeliveryServiceInfo, DeliveryServiceRef, DomainError, JobId,
        JobRecord, Origin, PendingFlag, RevalidationScope, ServerId, ServerStatus, TenantId, UserId,
    };

    use crate::changelog::ChangeLogEntry;
    use crate::jobs::{
        EngineError, EngineSettings, JobEngine, JobQuery, JobScope, ListOutcome, NewJobRequest,
        ReplaceJobRequest,
    };
    use crate::store::in_memory::{ServerRow, UserRow};
    use crate::store::{
        CdnLock, InMemoryStore, JobChanges, JobStore, JobTx, NewJob, StoreError, StoreState,
    };

    fn at(hour: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::hours(hour)
    }

    /// One hour before the fixture jobs start.
    fn now() -> DateTime<Utc> {
        at(-1)
    }

    fn tenant(id: i64, parent: Option<i64>) -> TenantNode {
        TenantNode {
            id: TenantId::new(id),
            name: format!("tenant-{id}"),
            parent: parent.map(TenantId::new),
            active: true,
        }
    }

    fn user(id: i64, name: &str, tenant: i64) -> UserRow {
        UserRow {
            id: UserId::new(id),
            username: name.to_string(),
            tenant_id: TenantId::new(tenant),
        }
    }

    fn ds(id: i64, xml_id: &str, tenant: i64, cdn: i64, origin: &str) -> DeliveryServiceInfo {
        DeliveryServiceInfo {
            id: DeliveryServiceId::new(id),
            xml_id: xml_id.to_string(),
            tenant_id: TenantId::new(tenant),
            cdn_id: CdnId::new(cdn),
            cdn_name: format!("cdn-{cdn}"),
            origin: Some(Origin {
                protocol: "http".to_string(),
                fqdn: origin.to_string(),
                port: None,
            }),
        }
    }

    fn server(id: i64, cdn: i64, status: ServerStatus) -> ServerRow {
        ServerRow {
            id: ServerId::new(id),
            host_name: format!("edge-{id}"),
            cdn_id: CdnId::new(cdn),
            status,
            watches_revalidation: true,
            upd_pending: false,
            reval_pending: false,
        }
    }

    fn fixture() -> StoreState {
        let mut state = StoreState::default();
        for node in [tenant(1, None), tenant(2, Some(1)), tenant(4, Some(1))] {
            state.tenants.insert(node);
        }
        state.users = vec![user(1, "admin", 1), user(2, "alice", 2), user(3, "bob", 4)];
        state.delivery_services = vec![
            ds(5, "demo1", 2, 1, "origin.example"),
            ds(6, "demo2", 4, 2, "other.example"),
        ];
        state.servers = vec![
            server(1, 1, ServerStatus::Reported),
            server(2, 1, ServerStatus::Offline),
            server(3, 2, ServerStatus::Reported),
        ];
        state
    }

    fn principal(id: i64, name: &str, tenant: i64) -> Principal {
        Principal {
            user_id: UserId::new(id),
            username: name.to_string(),
            tenant_id: TenantId::new(tenant),
            roles: vec![Role::new(Role::OPERATIONS)],
        }
    }

    fn admin() -> Principal {
        principal(1, "admin", 1)
    }

    fn alice() -> Principal {
        principal(2, "alice", 2)
    }

    fn bob() -> Principal {
        principal(3, "bob", 4)
    }

    fn setup() -> (InMemoryStore, JobEngine) {
        let store = InMemoryStore::new(fixture());
        let engine = JobEngine::new(Arc::new(store.clone()), EngineSettings::default());
        (store, engine)
    }

    fn create_req(ds: i64, url: &str, start: DateTime<Utc>, ttl: i64) -> NewJobRequest {
        NewJobRequest {
            delivery_service: DeliveryServiceRef::Id(DeliveryServiceId::new(ds)),
            asset_url: url.to_string(),
            start_time: start,
            ttl_hours: ttl,
        }
    }

    fn replace_req(job: &JobRecord) -> ReplaceJobRequest {
        ReplaceJobRequest {
            id: Some(job.id),
            delivery_service: Some(DeliveryServiceRef::Name(job.delivery_service.clone())),
            created_by: Some(job.created_by.clone()),
            asset_url: Some(job.asset_url.clone()),
            start_time: Some(job.start_time),
            ttl_hours: Some(i64::from(job.ttl_hours.get())),
            parameters: None,
        }
    }

    fn assert_domain(err: EngineError, check: impl FnOnce(&DomainError) -> bool) {
        match err {
            EngineError::Domain(e) if check(&e) => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn overlapping_jobs_both_succeed_with_one_warning() {
        let (store, engine) = setup();

        let first = engine
            .create(&alice(), create_req(5, "/path", at(0), 4), now())
            .await
            .unwrap();
        assert!(first.conflicts.is_empty());
        assert_eq!(first.record.asset_url, "http://origin.example/path");

        let second = engine
            .create(&alice(), create_req(5, "/path/sub", at(2), 4), now())
            .await
            .unwrap();
        assert_eq!(second.conflicts.len(), 1);
        let conflict = &second.conflicts[0];
        assert_eq!(conflict.job_id, first.record.id);
        assert_eq!((conflict.overlap_start, conflict.overlap_end), (at(2), at(4)));
        assert!(conflict.to_string().contains(&first.record.id.to_string()));

        let log = store.snapshot().await.change_log;
        assert_eq!(log.len(), 2);
        assert!(!log[0].message.contains("(duplicate)"));
        assert!(log[1].message.contains("(duplicate)"));
        assert_eq!(log[1].username, "alice");
    }

    #[tokio::test]
    async fn create_view_carries_derived_fields() {
        let (_store, engine) = setup();
        let job = engine
            .create(&alice(), create_req(5, "/img/*.png", at(0), 36), now())
            .await
            .unwrap()
            .view();
        assert_eq!(job.keyword, "PURGE");
        assert_eq!(job.parameters, "TTL:36h");
        assert_eq!(job.created_by, "alice");
        assert_eq!(job.delivery_service, "demo1");
    }

    #[tokio::test]
    async fn asset_url_must_live_under_the_origin() {
        let (_store, engine) = setup();
        let err = engine
            .create(&alice(), create_req(5, "http://evil.example/x", at(0), 1), now())
            .await
            .unwrap_err();
        assert_domain(err, |e| matches!(e, DomainError::Validation(m) if m.contains("origin")));

        let ok = engine
            .create(&alice(), create_req(5, "http://origin.example/x", at(0), 1), now())
            .await
            .unwrap();
        assert_eq!(ok.record.asset_url, "http://origin.example/x");
    }

    #[tokio::test]
    async fn create_rejects_bad_schedule_and_ttl() {
        let (store, engine) = setup();

        for (start, ttl) in [(at(-2), 1), (now() + Duration::days(3), 1), (at(0), 0)] {
            let err = engine
                .create(&alice(), create_req(5, "/a", start, ttl), now())
                .await
                .unwrap_err();
            assert_domain(err, |e| matches!(e, DomainError::Validation(_)));
        }

        store
            .with_state(|s| s.set_parameter("maxRevalDurationDays", "regex_revalidate.config", "1"))
            .await;
        let err = engine
            .create(&alice(), create_req(5, "/a", at(0), 25), now())
            .await
            .unwrap_err();
        assert_domain(err, |e| matches!(e, DomainError::Validation(m) if m.contains("24")));
        assert!(store.snapshot().await.jobs.is_empty());
    }

    #[tokio::test]
    async fn foreign_tenant_sees_not_found_never_forbidden() {
        let (_store, engine) = setup();
        let job = engine
            .create(&alice(), create_req(5, "/a", at(0), 1), now())
            .await
            .unwrap()
            .record;

        let missing = engine
            .create(&bob(), create_req(99, "/a", at(0), 1), now())
            .await
            .unwrap_err();
        let hidden = engine
            .create(&bob(), create_req(5, "/a", at(0), 1), now())
            .await
            .unwrap_err();
        assert_eq!(missing.to_string(), hidden.to_string());
        assert_domain(hidden, |e| matches!(e, DomainError::NotFound(_)));

        let err = engine.replace(&bob(), job.id, replace_req(&job), now()).await.unwrap_err();
        assert_domain(err, |e| matches!(e, DomainError::NotFound(_)));
        let err = engine.delete(&bob(), job.id, now()).await.unwrap_err();
        assert_domain(err, |e| matches!(e, DomainError::NotFound(_)));

        // Ancestor tenant may act.
        engine.delete(&admin(), job.id, now()).await.unwrap();
    }

    #[tokio::test]
    async fn started_job_cannot_be_replaced_whatever_the_payload() {
        let (_store, engine) = setup();
        let job = engine
            .create(&alice(), create_req(5, "/a", at(0), 4), now())
            .await
            .unwrap()
            .record;

        let mut garbage = replace_req(&job);
        garbage.id = Some(JobId::new(999));
        garbage.ttl_hours = Some(-5);
        for request in [replace_req(&job), garbage, ReplaceJobRequest::default()] {
            let err = engine.replace(&alice(), job.id, request, at(1)).await.unwrap_err();
            assert_domain(err, |e| *e == DomainError::AlreadyStarted);
        }

        // An undecodable payload is never even looked at.
        let err = engine
            .replace_with(&alice(), job.id, || Err(DomainError::validation("bad body")), at(1))
            .await
            .unwrap_err();
        assert_domain(err, |e| *e == DomainError::AlreadyStarted);
        let err = engine
            .replace_with(&alice(), job.id, || Err(DomainError::validation("bad body")), now())
            .await
            .unwrap_err();
        assert_domain(err, |e| matches!(e, DomainError::Validation(_)));

        // Delete is allowed at any point.
        engine.delete(&alice(), job.id, at(1)).await.unwrap();
    }

    #[tokio::test]
    async fn replace_rejects_every_identity_mismatch() {
        let (_store, engine) = setup();
        let job = engine
            .create(&alice(), create_req(5, "/a", at(0), 4), now())
            .await
            .unwrap()
            .record;

        let mut id = replace_req(&job);
        id.id = Some(JobId::new(job.id.get() + 1));
        let mut ds_name = replace_req(&job);
        ds_name.delivery_service = Some(DeliveryServiceRef::Name("demo2".to_string()));
        let mut ds_id = replace_req(&job);
        ds_id.delivery_service = Some(DeliveryServiceRef::Id(DeliveryServiceId::new(6)));
        let mut creator = replace_req(&job);
        creator.created_by = Some("admin".to_string());

        for (field, request) in [
            ("id", id),
            ("deliveryService", ds_name),
            ("deliveryService", ds_id),
            ("createdBy", creator),
        ] {
            let err = engine.replace(&alice(), job.id, request, now()).await.unwrap_err();
            assert_domain(err, |e| matches!(e, DomainError::ImmutableField(m) if m.contains(field)));
        }
    }

    #[tokio::test]
    async fn replace_updates_mutable_fields_and_marks_by_name() {
        let (store, engine) = setup();
        let job = engine
            .create(&alice(), create_req(5, "/a", at(0), 4), now())
            .await
            .unwrap()
            .record;
        store
            .with_state(|s| s.servers.iter_mut().for_each(|srv| srv.upd_pending = false))
            .await;

        let mut request = replace_req(&job);
        request.asset_url = Some("/a/b".to_string());
        request.start_time = Some(at(1));
        request.ttl_hours = None;
        request.parameters = Some("TTL:12h".to_string());
        let updated = engine.replace(&alice(), job.id, request, now()).await.unwrap();

        assert!(updated.conflicts.is_empty(), "a job never conflicts with itself");
        assert_eq!(updated.record.asset_url, "http://origin.example/a/b");
        assert_eq!(updated.view().parameters, "TTL:12h");
        assert_eq!(updated.record.last_updated, now());

        let state = store.snapshot().await;
        assert!(state.server("edge-1").unwrap().upd_pending);
        assert!(state.change_log.last().unwrap().message.starts_with("Updated"));
    }

    #[tokio::test]
    async fn ttl_hours_wins_over_legacy_parameters() {
        let (_store, engine) = setup();
        let job = engine
            .create(&alice(), create_req(5, "/a", at(0), 4), now())
            .await
            .unwrap()
            .record;
        let mut request = replace_req(&job);
        request.ttl_hours = Some(8);
        request.parameters = Some("TTL:2h".to_string());
        let updated = engine.replace(&alice(), job.id, request, now()).await.unwrap();
        assert_eq!(updated.record.ttl_hours.get(), 8);
    }

    #[tokio::test]
    async fn deleted_job_disappears_and_conditional_read_is_not_modified() {
        let (_store, engine) = setup();
        let job = engine
            .create(&alice(), create_req(5, "/a", at(0), 4), now())
            .await
            .unwrap()
            .record;

        let deleted_at = now() + Duration::minutes(10);
        let removed = engine.delete(&alice(), job.id, deleted_at).await.unwrap();
        assert_eq!(removed.id, job.id);

        let query = JobQuery::default();
        match engine.list(&alice(), &query, None, deleted_at).await.unwrap() {
            ListOutcome::Jobs { jobs, last_modified } => {
                assert!(jobs.is_empty());
                assert_eq!(last_modified, Some(deleted_at));
            }
            other => panic!("expected rows, got {other:?}"),
        }

        let outcome = engine
            .list(&alice(), &query, Some(deleted_at), deleted_at)
            .await
            .unwrap();
        assert!(matches!(outcome, ListOutcome::NotModified { .. }));

        let stale = deleted_at - Duration::seconds(1);
        let outcome = engine.list(&alice(), &query, Some(stale), deleted_at).await.unwrap();
        assert!(matches!(outcome, ListOutcome::Jobs { .. }));
    }

    #[tokio::test]
    async fn delete_later_in_the_same_second_is_not_hidden() {
        let (_store, engine) = setup();
        let created_at = now() + Duration::milliseconds(100);
        let job = engine
            .create(&alice(), create_req(5, "/a", at(0), 4), created_at)
            .await
            .unwrap()
            .record;

        // The client holds the whole-second Last-Modified of the first listing.
        let held = now();
        let deleted_at = now() + Duration::milliseconds(500);
        engine.delete(&alice(), job.id, deleted_at).await.unwrap();

        let outcome = engine
            .list(&alice(), &JobQuery::default(), Some(held), deleted_at)
            .await
            .unwrap();
        match outcome {
            ListOutcome::Jobs { jobs, last_modified } => {
                assert!(jobs.is_empty());
                assert_eq!(last_modified, Some(deleted_at));
            }
            other => panic!("deletion hidden by conditional read: {other:?}"),
        }
    }

    #[tokio::test]
    async fn listing_is_tenant_scoped_and_filterable() {
        let (_store, engine) = setup();
        engine.create(&alice(), create_req(5, "/a", at(0), 1), now()).await.unwrap();
        engine.create(&bob(), create_req(6, "/b", at(0), 1), now()).await.unwrap();

        let ids = |outcome: ListOutcome| match outcome {
            ListOutcome::Jobs { jobs, .. } => jobs.into_iter().map(|j| j.delivery_service).collect::<Vec<_>>(),
            other => panic!("expected rows, got {other:?}"),
        };

        let all = JobQuery::default();
        assert_eq!(ids(engine.list(&alice(), &all, None, now()).await.unwrap()), vec!["demo1"]);
        assert_eq!(ids(engine.list(&bob(), &all, None, now()).await.unwrap()), vec!["demo2"]);
        assert_eq!(
            ids(engine.list(&admin(), &all, None, now()).await.unwrap()),
            vec!["demo1", "demo2"]
        );

        let params: HashMap<String, String> = [("cdn".to_string(), "cdn-2".to_string())].into();
        let by_cdn = JobQuery::from_params(&params).unwrap();
        assert_eq!(ids(engine.list(&admin(), &by_cdn, None, now()).await.unwrap()), vec!["demo2"]);
    }

    #[tokio::test]
    async fn recency_window_hides_old_jobs_when_requested() {
        let (_store, engine) = setup();
        engine.create(&alice(), create_req(5, "/a", at(0), 1), now()).await.unwrap();

        let params: HashMap<String, String> = [("maxRevalDurationDays".to_string(), String::new())].into();
        let recent = JobQuery::from_params(&params).unwrap();
        let much_later = at(0) + Duration::days(91);

        match engine.list(&alice(), &recent, None, much_later).await.unwrap() {
            ListOutcome::Jobs { jobs, .. } => assert!(jobs.is_empty()),
            other => panic!("expected rows, got {other:?}"),
        }
        match engine.list(&alice(), &JobQuery::default(), None, much_later).await.unwrap() {
            ListOutcome::Jobs { jobs, .. } => assert_eq!(jobs.len(), 1),
            other => panic!("expected rows, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_recency_parameter_falls_back_to_default() {
        let (store, engine) = setup();
        store
            .with_state(|s| {
                s.set_parameter("maxRevalDurationDays", "regex_revalidate.config", "200000000000")
            })
            .await;
        engine.create(&alice(), create_req(5, "/a", at(0), 1), now()).await.unwrap();

        // Ceiling falls back to 90 days.
        let err = engine
            .create(&alice(), create_req(5, "/b", at(0), 90 * 24 + 1), now())
            .await
            .unwrap_err();
        assert_domain(err, |e| matches!(e, DomainError::Validation(m) if m.contains("2160")));

        let params: HashMap<String, String> = [("maxRevalDurationDays".to_string(), String::new())].into();
        let recent = JobQuery::from_params(&params).unwrap();
        match engine.list(&alice(), &recent, None, at(0) + Duration::days(91)).await.unwrap() {
            ListOutcome::Jobs { jobs, .. } => assert!(jobs.is_empty()),
            other => panic!("expected rows, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn revalidation_toggle_selects_the_flag() {
        let (store, engine) = setup();
        engine.create(&alice(), create_req(5, "/a", at(0), 1), now()).await.unwrap();
        let state = store.snapshot().await;
        let edge1 = state.server("edge-1").unwrap();
        assert!(edge1.upd_pending && !edge1.reval_pending);
        assert!(!state.server("edge-2").unwrap().upd_pending, "offline server skipped");
        assert!(!state.server("edge-3").unwrap().upd_pending, "other CDN untouched");

        store
            .with_state(|s| {
                s.servers.iter_mut().for_each(|srv| srv.upd_pending = false);
                s.set_parameter("use_reval_pending", "global", "1");
            })
            .await;
        engine.create(&alice(), create_req(5, "/b", at(0), 1), now()).await.unwrap();
        let edge1 = store.snapshot().await.server("edge-1").cloned().unwrap();
        assert!(edge1.reval_pending && !edge1.upd_pending);
    }

    #[tokio::test]
    async fn cdn_lock_blocks_other_users_unless_shared() {
        let (store, engine) = setup();
        store
            .with_state(|s| {
                s.cdn_locks.push(CdnLock {
                    cdn: CdnId::new(1),
                    username: "admin".to_string(),
                    shared_usernames: vec![],
                })
            })
            .await;

        let err = engine
            .create(&alice(), create_req(5, "/a", at(0), 1), now())
            .await
            .unwrap_err();
        assert_domain(err, |e| matches!(e, DomainError::Forbidden(m) if m.contains("admin")));

        engine.create(&admin(), create_req(5, "/a", at(0), 1), now()).await.unwrap();
        store
            .with_state(|s| s.cdn_locks[0].shared_usernames.push("alice".to_string()))
            .await;
        engine.create(&alice(), create_req(5, "/b", at(0), 1), now()).await.unwrap();
    }

    /// Store whose change-log append always fails after every other step succeeded.
    struct BrokenChangeLog(InMemoryStore);

    struct BrokenTx(Box<dyn JobTx>);

    #[async_trait]
    impl JobStore for BrokenChangeLog {
        async fn begin(&self) -> Result<Box<dyn JobTx>, StoreError> {
            Ok(Box::new(BrokenTx(self.0.begin().await?)))
        }
    }

    #[async_trait]
    impl TenantDirectory for BrokenTx {
        type Error = StoreError;

        async fn owning_tenant(&mut self, target: &AuthTarget) -> Result<Option<TenantId>, StoreError> {
            self.0.owning_tenant(target).await
        }

        async fn tenant_in_subtree(
            &mut self,
            acting: TenantId,
            target: TenantId,
        ) -> Result<Option<bool>, StoreError> {
            self.0.tenant_in_subtree(acting, target).await
        }
    }

    #[async_trait]
    impl JobTx for BrokenTx {
        async fn delivery_service(
            &mut self,
            reference: &DeliveryServiceRef,
        ) -> Result<Option<DeliveryServiceInfo>, StoreError> {
            self.0.delivery_service(reference).await
        }

        async fn accessible_tenants(&mut self, acting: TenantId) -> Result<Vec<TenantId>, StoreError> {
            self.0.accessible_tenants(acting).await
        }

        async fn parameter(&mut self, name: &str, config_file: &str) -> Result<Option<String>, StoreError> {
            self.0.parameter(name, config_file).await
        }

        async fn cdn_lock(&mut self, cdn: CdnId) -> Result<Option<CdnLock>, StoreError> {
            self.0.cdn_lock(cdn).await
        }

        async fn job(&mut self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
            self.0.job(id).await
        }

        async fn jobs_for_delivery_service(
            &mut self,
            ds: DeliveryServiceId,
        ) -> Result<Vec<JobRecord>, StoreError> {
            self.0.jobs_for_delivery_service(ds).await
        }

        async fn insert_job(&mut self, job: NewJob) -> Result<JobRecord, StoreError> {
            self.0.insert_job(job).await
        }

        async fn update_job(
            &mut self,
            id: JobId,
            changes: JobChanges,
            now: DateTime<Utc>,
        ) -> Result<JobRecord, StoreError> {
            self.0.update_job(id, changes, now).await
        }

        async fn delete_job(&mut self, id: JobId, now: DateTime<Utc>) -> Result<Option<JobRecord>, StoreError> {
            self.0.delete_job(id, now).await
        }

        async fn list_jobs(&mut self, scope: &JobScope, query: &JobQuery) -> Result<Vec<JobRecord>, StoreError> {
            self.0.list_jobs(scope, query).await
        }

        async fn jobs_last_modified(
            &mut self,
            scope: &JobScope,
            query: &JobQuery,
        ) -> Result<Option<DateTime<Utc>>, StoreError> {
            self.0.jobs_last_modified(scope, query).await
        }

        async fn mark_fleet(&mut self, scope: &RevalidationScope, flag: PendingFlag) -> Result<u64, StoreError> {
            self.0.mark_fleet(scope, flag).await
        }

        async fn append_change_log(&mut self, _entry: ChangeLogEntry) -> Result<(), StoreError> {
            Err(StoreError::Database("log table unavailable".to_string()))
        }

        async fn commit(self: Box<Self>) -> Result<(), StoreError> {
            self.0.commit().await
        }
    }

    #[tokio::test]
    async fn failed_post_step_rolls_back_mutation_and_flags() {
        let store = InMemoryStore::new(fixture());
        let engine = JobEngine::new(Arc::new(BrokenChangeLog(store.clone())), EngineSettings::default());

        let err = engine
            .create(&alice(), create_req(5, "/a", at(0), 1), now())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));

        let state = store.snapshot().await;
        assert!(state.jobs.is_empty());
        assert!(state.servers.iter().all(|s| !s.upd_pending && !s.reval_pending));
        assert!(state.change_log.is_empty());
    }
}
