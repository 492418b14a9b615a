use super::*;
use rand::Rng;

/// Origin zip that makes the in-process backend behave like a hung upstream
pub const TIMEOUT_TEST_ZIP: &str = "99999";

/// (carrier, service, price multiplier, base transit days, transit days per distance unit)
const SERVICES: &[(&str, &str, f64, f64, f64)] = &[
    ("FedEx", "Ground", 1.0, 3.0, 2.0),
    ("FedEx", "2Day", 1.5, 2.0, 0.0),
    ("FedEx", "Priority Overnight", 2.2, 1.0, 0.0),
    ("UPS", "Ground", 1.1, 3.0, 2.0),
    ("UPS", "2nd Day Air", 1.7, 2.0, 0.0),
    ("UPS", "Next Day Air", 2.3, 1.0, 0.0),
    ("USPS", "Priority Mail", 0.9, 2.0, 1.0),
    ("USPS", "Priority Mail Express", 1.6, 1.0, 0.0),
    ("DHL", "Express", 2.0, 1.0, 0.0),
];

const TRACKING_CHARS: &[u8] = b"0123456789ABCDEF";

/// Shipping service answered in-process with generated quotes and labels
pub struct InternalBackend {
    base_label_url: String,
}

impl InternalBackend {
    pub fn new() -> Self {
        Self {
            base_label_url: "https://shipvox.example.com".to_string(),
        }
    }

    /// Rough distance factor from the first digit of each zip
    fn distance_factor(origin: &str, destination: &str) -> f64 {
        let digit = |zip: &str| {
            zip.chars()
                .next()
                .and_then(|c| c.to_digit(10))
                .unwrap_or(0) as f64
        };
        (digit(origin) - digit(destination)).abs() / 10.0 + 0.5
    }

    fn quote(request: &RateRequest) -> Vec<ShippingOption> {
        let distance = Self::distance_factor(&request.origin_zip, &request.destination_zip);
        let base_rate = 5.0 + request.weight * 2.0 + distance * 5.0;

        let mut options: Vec<ShippingOption> = SERVICES
            .iter()
            .map(|(carrier, service, multiplier, days, days_per_distance)| ShippingOption {
                carrier: carrier.to_string(),
                service_name: service.to_string(),
                cost: (base_rate * multiplier * 100.0).round() / 100.0,
                transit_days: (days + days_per_distance * distance) as u32,
            })
            .collect();
        options.sort_by(|a, b| a.cost.total_cmp(&b.cost));
        options
    }

    fn tracking_number(carrier: &str) -> String {
        let mut rng = rand::rng();
        let suffix: String = (0..12)
            .map(|_| TRACKING_CHARS[rng.random_range(0..TRACKING_CHARS.len())] as char)
            .collect();
        format!("{}-{}", carrier.to_uppercase(), suffix)
    }
}

impl Default for InternalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShippingBackend for InternalBackend {
    async fn get_rates(&self, request: &RateRequest) -> BackendResult<RateResponse> {
        if request.origin_zip == TIMEOUT_TEST_ZIP {
            tracing::info!("Simulating a timeout for test zip {}", TIMEOUT_TEST_ZIP);
            return Err(BackendError::Timeout);
        }

        let all_options = Self::quote(request);
        let cheapest_option = all_options
            .first()
            .cloned()
            .ok_or_else(|| BackendError::InvalidResponse("no services available".to_string()))?;
        let fastest_option = all_options
            .iter()
            .min_by(|a, b| {
                a.transit_days
                    .cmp(&b.transit_days)
                    .then(a.cost.total_cmp(&b.cost))
            })
            .cloned();

        Ok(RateResponse {
            request: request.clone(),
            cheapest_option,
            fastest_option,
            all_options,
        })
    }

    async fn create_label(&self, request: &LabelRequest) -> BackendResult<LabelResponse> {
        let tracking_number = Self::tracking_number(&request.carrier);
        let estimated_delivery = chrono::Utc::now().timestamp() + 7 * 24 * 60 * 60;

        tracing::info!(
            "Created internal label {} for carrier {}",
            tracking_number,
            request.carrier
        );

        Ok(LabelResponse {
            label_url: format!("{}/labels/{}.pdf", self.base_label_url, tracking_number),
            fallback_qr_code_url: Some(format!(
                "{}/qr/{}.png",
                self.base_label_url, tracking_number
            )),
            native_qr_code_base64: None,
            carrier: request.carrier.clone(),
            service: Some(request.service_type.clone()),
            estimated_delivery: Value::from(estimated_delivery),
            tracking_number,
        })
    }

    fn name(&self) -> &str {
        "internal"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(origin: &str, weight: f64) -> RateRequest {
        RateRequest {
            origin_zip: origin.to_string(),
            destination_zip: "10001".to_string(),
            weight,
            dimensions: None,
            pickup_requested: false,
        }
    }

    #[tokio::test]
    async fn test_quotes_sorted_with_cheapest_and_fastest() {
        let backend = InternalBackend::new();
        let response = backend.get_rates(&request("89101", 2.0)).await.unwrap();

        assert_eq!(response.all_options.len(), SERVICES.len());
        assert!(response
            .all_options
            .windows(2)
            .all(|w| w[0].cost <= w[1].cost));
        assert_eq!(response.cheapest_option, response.all_options[0]);
        assert_eq!(response.fastest_option.unwrap().transit_days, 1);
    }

    #[tokio::test]
    async fn test_heavier_costs_more() {
        let backend = InternalBackend::new();
        let light = backend.get_rates(&request("89101", 1.0)).await.unwrap();
        let heavy = backend.get_rates(&request("89101", 20.0)).await.unwrap();
        assert!(heavy.cheapest_option.cost > light.cheapest_option.cost);
    }

    #[tokio::test]
    async fn test_timeout_zip() {
        let backend = InternalBackend::new();
        let err = backend
            .get_rates(&request(TIMEOUT_TEST_ZIP, 1.0))
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::Timeout);
    }

    #[test]
    fn test_tracking_number_format() {
        let tracking = InternalBackend::tracking_number("ups");
        assert!(tracking.starts_with("UPS-"));
        assert_eq!(tracking.len(), "UPS-".len() + 12);
    }
}
