//! Calendar repository: named exclusion calendars, persisted as opaque
//! blobs (the façade never interprets a calendar's internal structure,
//! matching the "calendars are collaborator-owned payloads" design note).

use sqlx::{PgConnection, Row};

use crate::error::{Result, StoreError};
use crate::gateway::{is_unique_violation, Gateway};
use crate::model::Calendar;

#[derive(Clone)]
pub struct CalendarRepository {
    gw: Gateway,
}

impl CalendarRepository {
    pub fn new(gw: Gateway) -> Self {
        Self { gw }
    }

    pub async fn insert(&self, conn: &mut PgConnection, calendar: &Calendar) -> Result<()> {
        let table = self.gw.table("CALENDARS");
        let sql = format!("INSERT INTO {table} (CALENDAR_NAME, CALENDAR) VALUES ($1, $2)");
        let result = sqlx::query(&sql)
            .bind(&calendar.name)
            .bind(&calendar.payload)
            .execute(&mut *conn)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::CalendarAlreadyExists(calendar.name.clone())),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn update(&self, conn: &mut PgConnection, calendar: &Calendar) -> Result<()> {
        let table = self.gw.table("CALENDARS");
        let sql = format!("UPDATE {table} SET CALENDAR = $1 WHERE CALENDAR_NAME = $2");
        sqlx::query(&sql)
            .bind(&calendar.payload)
            .bind(&calendar.name)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Delete a calendar, refusing while any trigger still references it
    /// (a calendar must never disappear out from under
    /// a live trigger).
    pub async fn delete(&self, conn: &mut PgConnection, name: &str) -> Result<bool> {
        if self.in_use(conn, name).await? {
            return Err(StoreError::CalendarInUse(name.to_string()));
        }

        let table = self.gw.table("CALENDARS");
        let sql = format!("DELETE FROM {table} WHERE CALENDAR_NAME = $1");
        let result = sqlx::query(&sql).bind(name).execute(&mut *conn).await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn in_use(&self, conn: &mut PgConnection, name: &str) -> Result<bool> {
        let triggers_table = self.gw.table("TRIGGERS");
        let sql = format!("SELECT 1 AS present FROM {triggers_table} WHERE CALENDAR_NAME = $1 LIMIT 1");
        let row = sqlx::query(&sql).bind(name).fetch_optional(&mut *conn).await?;
        Ok(row.is_some())
    }

    pub async fn get(&self, conn: &mut PgConnection, name: &str) -> Result<Option<Calendar>> {
        let table = self.gw.table("CALENDARS");
        let sql = format!("SELECT CALENDAR_NAME, CALENDAR FROM {table} WHERE CALENDAR_NAME = $1");
        let row = sqlx::query(&sql).bind(name).fetch_optional(&mut *conn).await?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(Calendar {
            name: row.try_get("CALENDAR_NAME")?,
            payload: row.try_get("CALENDAR")?,
        }))
    }

    pub async fn names(&self, conn: &mut PgConnection) -> Result<Vec<String>> {
        let table = self.gw.table("CALENDARS");
        let sql = format!("SELECT CALENDAR_NAME FROM {table}");
        let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
        rows.into_iter()
            .map(|r| r.try_get::<String, _>("CALENDAR_NAME").map_err(Into::into))
            .collect()
    }
}
