use std::collections::BTreeMap;

/// Label carrying the run identity on every object kiln creates.
pub const RUN_ID_LABEL: &str = "kiln-runid";

/// Label carrying the owning job name on every object kiln creates.
pub const JOB_LABEL: &str = "kiln-job";

/// Selector matching every object of one run.
pub fn run_selector(uuid: &str) -> String {
    format!("{RUN_ID_LABEL}={uuid}")
}

/// Selector matching every object of one job within a run.
pub fn job_selector(uuid: &str, job: &str) -> String {
    format!("{RUN_ID_LABEL}={uuid},{JOB_LABEL}={job}")
}

/// Labels that mark a resource as owned by this run and job.
pub fn managed_labels(uuid: &str, job: &str) -> BTreeMap<String, String> {
    BTreeMap::from_iter(vec![
        (RUN_ID_LABEL.to_owned(), uuid.to_owned()),
        (JOB_LABEL.to_owned(), job.to_owned()),
    ])
}
