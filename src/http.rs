use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::inventory::DeviceId;
use crate::series::Sample;
use crate::sink::{DeviceStatus, DeviceView, SeriesSink};

const CHART_Y_RANGE: [f64; 2] = [0.0, 60.0];
const AIR_SERIES_NAME: &str = "Air Temp (°C)";
const LIQUID_SERIES_NAME: &str = "Liquid Temp (°C)";

#[derive(Clone)]
pub struct HttpState {
    pub sink: SeriesSink,
}

#[derive(Debug, Serialize)]
pub struct DeviceSummary {
    pub id: DeviceId,
    pub address: String,
    pub status: DeviceStatus,
    pub latest: Option<Sample>,
}

impl From<&DeviceView> for DeviceSummary {
    fn from(view: &DeviceView) -> Self {
        Self {
            id: view.device.id,
            address: view.device.address.clone(),
            status: view.status(),
            latest: view.latest().cloned(),
        }
    }
}

/// Rendering hints for the chart of one device.
#[derive(Debug, Serialize)]
struct ChartSpec {
    title: String,
    y_axis_range: [f64; 2],
    air_series: &'static str,
    liquid_series: &'static str,
}

#[derive(Debug, Serialize)]
struct DeviceSamplesResponse {
    id: DeviceId,
    address: String,
    status: DeviceStatus,
    chart: ChartSpec,
    samples: Vec<Sample>,
}

pub fn device_summaries(sink: &SeriesSink) -> Vec<DeviceSummary> {
    sink.views().iter().map(DeviceSummary::from).collect()
}

async fn healthz() -> &'static str {
    "ok"
}

async fn list_devices(State(state): State<HttpState>) -> Json<Vec<DeviceSummary>> {
    Json(device_summaries(&state.sink))
}

async fn device_samples(
    State(state): State<HttpState>,
    Path(id): Path<DeviceId>,
) -> Result<Json<DeviceSamplesResponse>, (StatusCode, String)> {
    let view = state
        .sink
        .view(id)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("unknown device {id}")))?;
    Ok(Json(DeviceSamplesResponse {
        id,
        address: view.device.address.clone(),
        status: view.status(),
        chart: ChartSpec {
            title: format!("Temperatures CALLAN #{id} (last 24h)"),
            y_axis_range: CHART_Y_RANGE,
            air_series: AIR_SERIES_NAME,
            liquid_series: LIQUID_SERIES_NAME,
        },
        samples: view.samples.to_vec(),
    }))
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/devices", get(list_devices))
        .route("/v1/devices/{id}/samples", get(device_samples))
        .with_state(state)
}
