use rusqlite::{Connection, OptionalExtension, params};
use std::sync::Mutex;

use crate::models::datasource::{AuthType, DataSource, DsType};

/// One ACL row as stored; interpretation happens in the authz service.
#[derive(Debug, Clone)]
pub struct AclRow {
    pub principal_type: String,
    pub principal_id: String,
    pub permission: String,
}

pub struct ConfigDb {
    conn: Mutex<Connection>,
}

impl ConfigDb {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS organizations (
                id         TEXT PRIMARY KEY,
                name       TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );

            CREATE TABLE IF NOT EXISTS users (
                id         TEXT PRIMARY KEY,
                email      TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );

            CREATE TABLE IF NOT EXISTS org_memberships (
                user_id    TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                org_id     TEXT NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
                role       TEXT NOT NULL CHECK(role IN ('admin','editor','viewer')),
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                PRIMARY KEY (user_id, org_id)
            );

            CREATE TABLE IF NOT EXISTS user_groups (
                id         TEXT PRIMARY KEY,
                org_id     TEXT NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
                name       TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );

            CREATE TABLE IF NOT EXISTS group_members (
                group_id   TEXT NOT NULL REFERENCES user_groups(id) ON DELETE CASCADE,
                user_id    TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                PRIMARY KEY (group_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS acl_entries (
                id             TEXT PRIMARY KEY,
                org_id         TEXT NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
                resource_type  TEXT NOT NULL CHECK(resource_type IN ('datasource','dashboard')),
                resource_id    TEXT NOT NULL,
                principal_type TEXT NOT NULL CHECK(principal_type IN ('user','group')),
                principal_id   TEXT NOT NULL,
                permission     TEXT NOT NULL CHECK(permission IN ('view','edit','admin')),
                created_at     TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_acl_resource ON acl_entries(org_id, resource_type, resource_id);

            CREATE TABLE IF NOT EXISTS datasources (
                id          TEXT PRIMARY KEY,
                org_id      TEXT NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
                name        TEXT NOT NULL,
                ds_type     TEXT NOT NULL,
                url         TEXT NOT NULL,
                auth_type   TEXT NOT NULL DEFAULT 'none',
                auth_config TEXT NOT NULL DEFAULT '{}',
                config      TEXT NOT NULL DEFAULT '{}',
                is_default  INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                UNIQUE(org_id, name)
            );
            CREATE INDEX IF NOT EXISTS idx_datasources_org ON datasources(org_id);

            CREATE TABLE IF NOT EXISTS dashboards (
                id         TEXT PRIMARY KEY,
                org_id     TEXT NOT NULL REFERENCES organizations(id) ON DELETE CASCADE,
                name       TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_dashboards_org ON dashboards(org_id);
            ",
        )?;
        Ok(())
    }

    // ── Organization / membership operations ──

    pub fn create_organization(&self, id: &str, name: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("INSERT INTO organizations (id, name) VALUES (?1, ?2)", params![id, name])?;
        Ok(())
    }

    pub fn organization_exists(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM organizations WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    pub fn create_user(&self, id: &str, email: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("INSERT INTO users (id, email) VALUES (?1, ?2)", params![id, email])?;
        Ok(())
    }

    pub fn upsert_membership(&self, user_id: &str, org_id: &str, role: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO org_memberships (user_id, org_id, role) VALUES (?1, ?2, ?3) \
             ON CONFLICT(user_id, org_id) DO UPDATE SET role = excluded.role",
            params![user_id, org_id, role],
        )?;
        Ok(())
    }

    pub fn membership_role(&self, user_id: &str, org_id: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let role = conn
            .query_row(
                "SELECT role FROM org_memberships WHERE user_id = ?1 AND org_id = ?2",
                params![user_id, org_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(role)
    }

    // ── Group operations ──

    pub fn create_group(&self, id: &str, org_id: &str, name: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO user_groups (id, org_id, name) VALUES (?1, ?2, ?3)",
            params![id, org_id, name],
        )?;
        Ok(())
    }

    pub fn add_group_member(&self, group_id: &str, user_id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO group_members (group_id, user_id) VALUES (?1, ?2)",
            params![group_id, user_id],
        )?;
        Ok(())
    }

    /// Groups the user belongs to within one org.
    pub fn group_ids_for_user(&self, user_id: &str, org_id: &str) -> anyhow::Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT g.id FROM user_groups g \
             INNER JOIN group_members m ON m.group_id = g.id \
             WHERE m.user_id = ?1 AND g.org_id = ?2",
        )?;
        let rows = stmt
            .query_map(params![user_id, org_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(rows)
    }

    // ── ACL operations ──

    pub fn add_acl_entry(
        &self,
        id: &str,
        org_id: &str,
        resource_type: &str,
        resource_id: &str,
        principal_type: &str,
        principal_id: &str,
        permission: &str,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO acl_entries (id, org_id, resource_type, resource_id, principal_type, principal_id, permission) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![id, org_id, resource_type, resource_id, principal_type, principal_id, permission],
        )?;
        Ok(())
    }

    pub fn acl_rows(
        &self,
        org_id: &str,
        resource_type: &str,
        resource_id: &str,
    ) -> anyhow::Result<Vec<AclRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT principal_type, principal_id, permission FROM acl_entries \
             WHERE org_id = ?1 AND resource_type = ?2 AND resource_id = ?3",
        )?;
        let rows = stmt
            .query_map(params![org_id, resource_type, resource_id], |row| {
                Ok(AclRow {
                    principal_type: row.get(0)?,
                    principal_id: row.get(1)?,
                    permission: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Dashboard metadata (resource existence only; CRUD lives elsewhere) ──

    pub fn create_dashboard(&self, id: &str, org_id: &str, name: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO dashboards (id, org_id, name) VALUES (?1, ?2, ?3)",
            params![id, org_id, name],
        )?;
        Ok(())
    }

    /// The org a resource belongs to, if it exists at all.
    pub fn resource_org(&self, resource_type: &str, resource_id: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let sql = match resource_type {
            "datasource" => "SELECT org_id FROM datasources WHERE id = ?1",
            "dashboard" => "SELECT org_id FROM dashboards WHERE id = ?1",
            _ => return Ok(None),
        };
        let org = conn
            .query_row(sql, params![resource_id], |row| row.get(0))
            .optional()?;
        Ok(org)
    }

    // ── Datasource operations ──

    fn datasource_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DataSource> {
        let ds_type_raw: String = row.get(3)?;
        let auth_type_raw: String = row.get(5)?;
        let auth_config_raw: String = row.get(6)?;
        let config_raw: String = row.get(7)?;
        Ok(DataSource {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            name: row.get(2)?,
            ds_type: DsType::parse(&ds_type_raw).unwrap_or(DsType::Prometheus),
            url: row.get(4)?,
            auth_type: AuthType::parse(&auth_type_raw).unwrap_or(AuthType::None),
            auth_config: serde_json::from_str(&auth_config_raw).unwrap_or_default(),
            config: serde_json::from_str(&config_raw).unwrap_or_default(),
            is_default: row.get::<_, i64>(8)? != 0,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    const DS_COLUMNS: &'static str =
        "id, org_id, name, ds_type, url, auth_type, auth_config, config, is_default, created_at, updated_at";

    pub fn create_datasource(&self, ds: &DataSource) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        if ds.is_default {
            tx.execute(
                "UPDATE datasources SET is_default = 0 WHERE org_id = ?1 AND ds_type = ?2",
                params![ds.organization_id, ds.ds_type.as_str()],
            )?;
        }
        tx.execute(
            "INSERT INTO datasources (id, org_id, name, ds_type, url, auth_type, auth_config, config, is_default) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                ds.id,
                ds.organization_id,
                ds.name,
                ds.ds_type.as_str(),
                ds.url,
                ds.auth_type.as_str(),
                serde_json::Value::Object(ds.auth_config.clone()).to_string(),
                serde_json::Value::Object(ds.config.clone()).to_string(),
                ds.is_default as i64,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_datasource(&self, id: &str) -> anyhow::Result<Option<DataSource>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM datasources WHERE id = ?1", Self::DS_COLUMNS);
        let ds = conn
            .query_row(&sql, params![id], Self::datasource_from_row)
            .optional()?;
        Ok(ds)
    }

    pub fn list_datasources(&self, org_id: &str) -> anyhow::Result<Vec<DataSource>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM datasources WHERE org_id = ?1 ORDER BY name ASC",
            Self::DS_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![org_id], Self::datasource_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_datasource(&self, ds: &DataSource) -> anyhow::Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        if ds.is_default {
            tx.execute(
                "UPDATE datasources SET is_default = 0 WHERE org_id = ?1 AND ds_type = ?2 AND id != ?3",
                params![ds.organization_id, ds.ds_type.as_str(), ds.id],
            )?;
        }
        let count = tx.execute(
            "UPDATE datasources SET name = ?2, ds_type = ?3, url = ?4, auth_type = ?5, \
             auth_config = ?6, config = ?7, is_default = ?8, \
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') \
             WHERE id = ?1",
            params![
                ds.id,
                ds.name,
                ds.ds_type.as_str(),
                ds.url,
                ds.auth_type.as_str(),
                serde_json::Value::Object(ds.auth_config.clone()).to_string(),
                serde_json::Value::Object(ds.config.clone()).to_string(),
                ds.is_default as i64,
            ],
        )?;
        tx.commit()?;
        Ok(count > 0)
    }

    pub fn delete_datasource(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute("DELETE FROM datasources WHERE id = ?1", params![id])?;
        Ok(count > 0)
    }
}
