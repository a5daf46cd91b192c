use chrono::{DateTime, Utc};
use ftl_core::{CronJobKey, DeploymentKey};
use tracing::debug;

use super::async_calls::insert_async_call;
use super::{StateStore, get_row, put_row, scan_rows};
use crate::error::{StateError, StateResult};
use crate::tables::CRON_JOBS;
use crate::types::{AsyncCall, CronJob, NewAsyncCall};

impl StateStore {
    pub fn put_cron_job(&self, job: &CronJob) -> StateResult<()> {
        let key = job.key.to_string();
        self.write(|txn| {
            let mut table = txn.open_table(CRON_JOBS).map_err(map_err!(Table))?;
            put_row(&mut table, &key, job)
        })?;
        debug!(%key, schedule = %job.schedule, "cron job stored");
        Ok(())
    }

    pub fn get_cron_job(&self, key: &CronJobKey) -> StateResult<Option<CronJob>> {
        self.read(|txn| {
            let table = txn.open_table(CRON_JOBS).map_err(map_err!(Table))?;
            get_row(&table, &key.to_string())
        })
    }

    pub fn list_cron_jobs(&self) -> StateResult<Vec<CronJob>> {
        self.read(|txn| {
            let table = txn.open_table(CRON_JOBS).map_err(map_err!(Table))?;
            scan_rows(&table, "")
        })
    }

    pub fn cron_jobs_for_deployment(&self, deployment: &DeploymentKey) -> StateResult<Vec<CronJob>> {
        Ok(self
            .list_cron_jobs()?
            .into_iter()
            .filter(|job| job.deployment == *deployment)
            .collect())
    }

    /// Delete a deployment's jobs. Returns how many were removed.
    pub fn delete_cron_jobs_for_deployment(&self, deployment: &DeploymentKey) -> StateResult<usize> {
        let removed = self.write(|txn| {
            let mut table = txn.open_table(CRON_JOBS).map_err(map_err!(Table))?;
            let owned: Vec<String> = scan_rows::<CronJob, _>(&table, "")?
                .into_iter()
                .filter(|job| job.deployment == *deployment)
                .map(|job| job.key.to_string())
                .collect();
            for key in &owned {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            Ok(owned.len())
        })?;
        debug!(%deployment, removed, "cron jobs removed");
        Ok(removed)
    }

    /// Create the async call for a job's next firing and record it on the
    /// job, atomically. `last_execution` is set when the firing being
    /// replaced has run.
    pub fn schedule_cron_job(
        &self,
        key: &CronJobKey,
        call: &NewAsyncCall,
        last_execution: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StateResult<(CronJob, AsyncCall)> {
        self.write(|txn| {
            let mut job: CronJob = {
                let table = txn.open_table(CRON_JOBS).map_err(map_err!(Table))?;
                get_row(&table, &key.to_string())?
                    .ok_or_else(|| StateError::NotFound(format!("cron job {key} not found")))?
            };
            let created = insert_async_call(txn, call, now)?;
            job.next_execution = call.scheduled_at;
            job.last_async_call = Some(created.id);
            if last_execution.is_some() {
                job.last_execution = last_execution;
            }
            let mut table = txn.open_table(CRON_JOBS).map_err(map_err!(Table))?;
            put_row(&mut table, &key.to_string(), &job)?;
            Ok((job, created))
        })
    }
}
