use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStep {
    pub instruction: String,
    pub distance_meters: f64,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub steps: Vec<RouteStep>,
    pub distance_meters: f64,
    pub duration_seconds: f64,
}

impl Route {
    pub fn from_steps(steps: Vec<RouteStep>) -> Self {
        let distance_meters = steps.iter().map(|step| step.distance_meters).sum();
        let duration_seconds = steps.iter().map(|step| step.duration_seconds).sum();

        Self {
            steps,
            distance_meters,
            duration_seconds,
        }
    }
}
