//! Role -> permission matrix held as an immutable, versioned snapshot.
//!
//! Readers clone an `Arc` to the current snapshot and never block writers for longer
//! than the pointer copy. Writers serialize on an async mutex, persist the next version
//! with an optimistic version check, then swap the pointer.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::models::{Permission, Role};
use crate::services::error::ServiceError;
use crate::services::store::{CredentialStore, RolePermissionDocument, StoreError};

/// Permission ids granted to each role out of the box.
fn default_grants(role: Role) -> &'static [&'static str] {
    match role {
        Role::Patient => &[
            "patient.read",
            "appointment.read",
            "appointment.create",
            "appointment.cancel",
            "medical_record.read",
            "prescription.read",
            "lab.read",
        ],
        Role::Doctor => &[
            "patient.read",
            "patient.update",
            "medical_record.read",
            "medical_record.create",
            "medical_record.update",
            "appointment.read",
            "appointment.create",
            "appointment.update",
            "prescription.read",
            "prescription.create",
            "lab.read",
            "lab.create",
        ],
        Role::Nurse => &[
            "patient.read",
            "patient.update",
            "medical_record.read",
            "medical_record.update",
            "appointment.read",
            "appointment.update",
            "lab.read",
        ],
        Role::Pharmacist => &["patient.read", "prescription.read", "prescription.dispense"],
        Role::LabTechnician => &["patient.read", "lab.read", "lab.create", "lab.update"],
        Role::Staff => &[
            "patient.read",
            "patient.create",
            "patient.update",
            "appointment.read",
            "appointment.create",
            "appointment.update",
            "appointment.cancel",
            "user.read",
        ],
        Role::ExternalRequester => &["medical_record.request"],
        Role::Admin => &[],
    }
}

/// The stored document seeded on first start.
pub fn default_document() -> RolePermissionDocument {
    Role::ALL
        .iter()
        .filter(|role| **role != Role::Admin)
        .map(|&role| {
            let grants = default_grants(role)
                .iter()
                .filter_map(|id| id.parse::<Permission>().ok())
                .collect::<BTreeSet<_>>();
            (role, grants)
        })
        .collect()
}

#[derive(Debug)]
pub struct MatrixSnapshot {
    version: i64,
    roles: HashMap<Role, HashSet<Permission>>,
}

impl MatrixSnapshot {
    /// Builds the lookup index; the admin entry is always the whole catalog.
    pub fn build(version: i64, document: &RolePermissionDocument) -> Self {
        let mut roles: HashMap<Role, HashSet<Permission>> = Role::ALL
            .iter()
            .map(|role| (*role, HashSet::new()))
            .collect();
        for (role, permissions) in document {
            if *role != Role::Admin {
                roles.insert(*role, permissions.iter().cloned().collect());
            }
        }
        roles.insert(Role::Admin, Permission::all().collect());
        Self { version, roles }
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn has_permission(&self, role: Role, permission: &Permission) -> bool {
        self.roles
            .get(&role)
            .map(|set| set.contains(permission))
            .unwrap_or(false)
    }

    pub fn permissions_for(&self, role: Role) -> BTreeSet<Permission> {
        self.roles
            .get(&role)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Full view including the computed admin entry.
    pub fn roles(&self) -> BTreeMap<Role, BTreeSet<Permission>> {
        Role::ALL
            .iter()
            .map(|role| (*role, self.permissions_for(*role)))
            .collect()
    }

    /// What gets persisted: every role except admin.
    fn stored_document(&self) -> RolePermissionDocument {
        Role::ALL
            .iter()
            .filter(|role| **role != Role::Admin)
            .map(|role| (*role, self.permissions_for(*role)))
            .collect()
    }
}

pub struct PermissionMatrix {
    store: Arc<dyn CredentialStore>,
    current: RwLock<Arc<MatrixSnapshot>>,
    writer: Mutex<()>,
}

impl PermissionMatrix {
    /// Loads the latest stored version, seeding the defaults as version 1 when empty.
    pub async fn load(store: Arc<dyn CredentialStore>) -> Result<Self, ServiceError> {
        let snapshot = Self::fetch_or_seed(store.as_ref()).await?;
        tracing::info!(version = snapshot.version(), "Permission matrix loaded");
        Ok(Self {
            store,
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
        })
    }

    async fn fetch_or_seed(store: &dyn CredentialStore) -> Result<MatrixSnapshot, ServiceError> {
        if let Some((version, document)) = store.load_permission_matrix().await? {
            return Ok(MatrixSnapshot::build(version, &document));
        }

        let document = default_document();
        match store.save_permission_matrix(0, &document, None).await {
            Ok(()) => {
                tracing::info!("Seeded default permission matrix");
                Ok(MatrixSnapshot::build(1, &document))
            }
            // Another instance seeded first
            Err(StoreError::VersionConflict { .. }) => {
                let (version, document) = store
                    .load_permission_matrix()
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("permission matrix vanished after seeding"))?;
                Ok(MatrixSnapshot::build(version, &document))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The current snapshot. All readers go through here.
    pub fn snapshot(&self) -> Arc<MatrixSnapshot> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn has_permission(&self, role: Role, permission: &Permission) -> bool {
        self.snapshot().has_permission(role, permission)
    }

    /// Installs a newer stored version, if there is one. Returns whether the snapshot changed.
    pub async fn refresh(&self) -> Result<bool, ServiceError> {
        let _guard = self.writer.lock().await;
        let Some((version, document)) = self.store.load_permission_matrix().await? else {
            return Ok(false);
        };
        if version <= self.snapshot().version() {
            return Ok(false);
        }
        self.install(Arc::new(MatrixSnapshot::build(version, &document)));
        tracing::info!(version, "Picked up permission matrix written elsewhere");
        Ok(true)
    }

    /// Polls the store every `period` so several instances converge on the latest version.
    pub fn spawn_refresh(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.refresh().await {
                    tracing::warn!(error = %e, "Permission matrix refresh failed");
                }
            }
        })
    }

    fn install(&self, snapshot: Arc<MatrixSnapshot>) {
        match self.current.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }

    /// Replaces one role's permission set and publishes the new snapshot atomically.
    pub async fn set_role_permissions(
        &self,
        role: Role,
        permission_ids: &[String],
        updated_by: Option<Uuid>,
    ) -> Result<Arc<MatrixSnapshot>, ServiceError> {
        if role == Role::Admin {
            return Err(ServiceError::AdminPermissionsComputed);
        }

        let mut unknown = Vec::new();
        let mut permissions = BTreeSet::new();
        for id in permission_ids {
            match id.parse::<Permission>() {
                Ok(p) => {
                    permissions.insert(p);
                }
                Err(id) => unknown.push(id),
            }
        }
        if !unknown.is_empty() {
            return Err(ServiceError::UnknownPermission(unknown));
        }

        let _guard = self.writer.lock().await;
        let current = self.snapshot();
        let mut document = current.stored_document();
        document.insert(role, permissions);

        match self
            .store
            .save_permission_matrix(current.version(), &document, updated_by)
            .await
        {
            Ok(()) => {}
            Err(StoreError::VersionConflict { expected }) => {
                // Someone else wrote a newer version; pick it up for the next attempt
                if let Ok(fresh) = Self::fetch_or_seed(self.store.as_ref()).await {
                    self.install(Arc::new(fresh));
                }
                tracing::warn!(expected, role = %role, "Permission matrix write lost a version race");
                return Err(ServiceError::MatrixVersionConflict);
            }
            Err(e) => return Err(e.into()),
        }

        let next = Arc::new(MatrixSnapshot::build(current.version() + 1, &document));
        self.install(next.clone());
        tracing::info!(
            role = %role,
            version = next.version(),
            updated_by = ?updated_by,
            "Role permissions updated"
        );
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::InMemoryCredentialStore;

    fn perm(id: &str) -> Permission {
        id.parse().unwrap()
    }

    async fn matrix() -> (Arc<InMemoryCredentialStore>, PermissionMatrix) {
        let store = Arc::new(InMemoryCredentialStore::new());
        let matrix = PermissionMatrix::load(store.clone()).await.unwrap();
        (store, matrix)
    }

    #[tokio::test]
    async fn test_seeds_defaults_as_version_one() {
        let (_, matrix) = matrix().await;
        let snapshot = matrix.snapshot();
        assert_eq!(snapshot.version(), 1);
        assert!(snapshot.has_permission(Role::Doctor, &perm("prescription.create")));
        assert!(!snapshot.has_permission(Role::Patient, &perm("prescription.create")));
        assert!(snapshot.has_permission(Role::ExternalRequester, &perm("medical_record.request")));
    }

    #[tokio::test]
    async fn test_admin_holds_the_whole_catalog() {
        let (_, matrix) = matrix().await;
        for permission in Permission::all() {
            assert!(matrix.has_permission(Role::Admin, &permission));
        }
    }

    #[tokio::test]
    async fn test_lookups_are_stable_until_changed() {
        let (_, matrix) = matrix().await;
        let p = perm("lab.update");
        let first = matrix.has_permission(Role::Nurse, &p);
        for _ in 0..10 {
            assert_eq!(matrix.has_permission(Role::Nurse, &p), first);
        }

        matrix
            .set_role_permissions(Role::Nurse, &["lab.update".to_string()], None)
            .await
            .unwrap();
        assert!(matrix.has_permission(Role::Nurse, &p));
        assert!(!matrix.has_permission(Role::Nurse, &perm("patient.read")));
    }

    #[tokio::test]
    async fn test_old_snapshot_stays_whole_after_swap() {
        let (_, matrix) = matrix().await;
        let before = matrix.snapshot();
        matrix
            .set_role_permissions(Role::Pharmacist, &[], None)
            .await
            .unwrap();

        assert_eq!(before.version(), 1);
        assert!(before.has_permission(Role::Pharmacist, &perm("prescription.dispense")));
        assert_eq!(matrix.snapshot().version(), 2);
        assert!(matrix.snapshot().permissions_for(Role::Pharmacist).is_empty());
    }

    #[tokio::test]
    async fn test_rejects_unknown_ids_and_admin_writes() {
        let (_, matrix) = matrix().await;
        let err = matrix
            .set_role_permissions(
                Role::Staff,
                &["user.read".to_string(), "user.fly".to_string()],
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::UnknownPermission(ids) if ids == vec!["user.fly"]));

        let err = matrix
            .set_role_permissions(Role::Admin, &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AdminPermissionsComputed));
        assert_eq!(matrix.snapshot().version(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_writer_elsewhere_causes_conflict_then_recovers() {
        let (store, matrix) = matrix().await;
        store
            .save_permission_matrix(1, &default_document(), None)
            .await
            .unwrap();

        let err = matrix
            .set_role_permissions(Role::Staff, &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::MatrixVersionConflict));

        matrix
            .set_role_permissions(Role::Staff, &[], None)
            .await
            .unwrap();
        assert_eq!(matrix.snapshot().version(), 3);
    }

    #[tokio::test]
    async fn test_refresh_picks_up_versions_written_elsewhere() {
        let (store, matrix) = matrix().await;
        assert!(!matrix.refresh().await.unwrap());

        let mut document = default_document();
        document.insert(Role::Staff, BTreeSet::from([perm("lab.read")]));
        store.save_permission_matrix(1, &document, None).await.unwrap();

        let before = matrix.snapshot();
        assert!(matrix.refresh().await.unwrap());
        assert_eq!(matrix.snapshot().version(), 2);
        assert!(matrix.has_permission(Role::Staff, &perm("lab.read")));
        assert_eq!(before.version(), 1);
        assert!(!matrix.refresh().await.unwrap());
    }

    #[tokio::test]
    async fn test_background_refresh_converges() {
        let (store, matrix) = matrix().await;
        let matrix = Arc::new(matrix);
        let handle = matrix.clone().spawn_refresh(Duration::from_millis(10));

        store
            .save_permission_matrix(1, &default_document(), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(matrix.snapshot().version(), 2);
        handle.abort();
    }

    #[tokio::test]
    async fn test_reload_picks_up_persisted_version() {
        let (store, matrix) = matrix().await;
        matrix
            .set_role_permissions(Role::Staff, &["user.read".to_string()], None)
            .await
            .unwrap();

        let reloaded = PermissionMatrix::load(store).await.unwrap();
        assert_eq!(reloaded.snapshot().version(), 2);
        assert_eq!(
            reloaded.snapshot().permissions_for(Role::Staff),
            BTreeSet::from([perm("user.read")])
        );
    }
}
