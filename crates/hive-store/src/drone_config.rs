use rusqlite::{params, OptionalExtension, Row};

use hive_domain::DroneConfig;

use crate::error::StoreError;
use crate::store::Store;

const CONFIG_COLS: &str = "name, ssh_user, ssh_port, ssh_key_path, ssh_password, core_limit, \
     job_count, mem_cap_gb, auto_reboot, protected, max_failures, binhost_target, display_name, \
     control_tag, locked, notes";

fn config_from_row(row: &Row<'_>) -> rusqlite::Result<DroneConfig> {
    Ok(DroneConfig {
        name: row.get(0)?,
        ssh_user: row.get(1)?,
        ssh_port: row.get(2)?,
        ssh_key_path: row.get(3)?,
        ssh_password: row.get(4)?,
        core_limit: row.get(5)?,
        job_count: row.get(6)?,
        mem_cap_gb: row.get(7)?,
        auto_reboot: row.get(8)?,
        protected: row.get(9)?,
        max_failures: row.get(10)?,
        binhost_target: row.get(11)?,
        display_name: row.get(12)?,
        control_tag: row.get(13)?,
        locked: row.get(14)?,
        notes: row.get(15)?,
    })
}

impl Store {
    pub fn upsert_drone_config(&self, cfg: &DroneConfig) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO drone_config (name, ssh_user, ssh_port, ssh_key_path, ssh_password, \
                 core_limit, job_count, mem_cap_gb, auto_reboot, protected, max_failures, \
                 binhost_target, display_name, control_tag, locked, notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(name) DO UPDATE SET
                 ssh_user = excluded.ssh_user,
                 ssh_port = excluded.ssh_port,
                 ssh_key_path = excluded.ssh_key_path,
                 ssh_password = excluded.ssh_password,
                 core_limit = excluded.core_limit,
                 job_count = excluded.job_count,
                 mem_cap_gb = excluded.mem_cap_gb,
                 auto_reboot = excluded.auto_reboot,
                 protected = excluded.protected,
                 max_failures = excluded.max_failures,
                 binhost_target = excluded.binhost_target,
                 display_name = excluded.display_name,
                 control_tag = excluded.control_tag,
                 locked = excluded.locked,
                 notes = excluded.notes",
            params![
                cfg.name,
                cfg.ssh_user,
                cfg.ssh_port,
                cfg.ssh_key_path,
                cfg.ssh_password,
                cfg.core_limit,
                cfg.job_count,
                cfg.mem_cap_gb,
                cfg.auto_reboot,
                cfg.protected,
                cfg.max_failures,
                cfg.binhost_target,
                cfg.display_name,
                cfg.control_tag,
                cfg.locked,
                cfg.notes
            ],
        )?;
        Ok(())
    }

    pub fn get_drone_config(&self, name: &str) -> Result<Option<DroneConfig>, StoreError> {
        Ok(self
            .lock()
            .query_row(
                &format!("SELECT {} FROM drone_config WHERE name = ?1", CONFIG_COLS),
                [name],
                config_from_row,
            )
            .optional()?)
    }

    pub fn list_drone_configs(&self) -> Result<Vec<DroneConfig>, StoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT {} FROM drone_config ORDER BY name", CONFIG_COLS))?;
        let configs = stmt
            .query_map([], config_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(configs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_and_fetch() {
        let store = Store::open_in_memory().unwrap();
        let mut cfg = DroneConfig::new("alpha");
        cfg.ssh_user = Some("root".into());
        cfg.ssh_port = Some(2222);
        cfg.auto_reboot = true;
        store.upsert_drone_config(&cfg).unwrap();

        cfg.notes = Some("flaky PSU".into());
        store.upsert_drone_config(&cfg).unwrap();

        let got = store.get_drone_config("alpha").unwrap().unwrap();
        assert_eq!(got.ssh_port, Some(2222));
        assert_eq!(got.notes.as_deref(), Some("flaky PSU"));
        assert!(got.auto_reboot);
        assert_eq!(store.list_drone_configs().unwrap().len(), 1);
    }
}
