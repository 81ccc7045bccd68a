use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use super::broker::BrokerApi;
use super::error::{ApiError, ApiResult};
use super::signer::{parse_form, percent_encode, OAuth1Signer, RequestSigner, SigningToken};
use super::types::*;
use crate::connection::AccessCredential;
use crate::core::config::BrokerConfig;

const LIVE_BASE_URL: &str = "https://etws.etrade.com";
const SANDBOX_BASE_URL: &str = "https://etwssandbox.etrade.com";
const AUTHORIZE_URL: &str = "https://us.etrade.com/e/t/etws/authorize";

/// Largest positions page the broker hands out.
const MAX_POSITIONS_PER_PAGE: u32 = 25;

pub struct EtradeClient {
    client: Client,
    consumer_key: String,
    has_consumer_secret: bool,
    sandbox: bool,
    signer: Arc<dyn RequestSigner>,
    credential: RwLock<Option<AccessCredential>>,
}

impl EtradeClient {
    pub fn new(config: &BrokerConfig) -> Self {
        let signer = Arc::new(OAuth1Signer::new(
            config.consumer_key.clone(),
            config.consumer_secret.clone(),
        ));
        Self::with_signer(config, signer)
    }

    pub fn with_signer(config: &BrokerConfig, signer: Arc<dyn RequestSigner>) -> Self {
        Self {
            client: Client::new(),
            consumer_key: config.consumer_key.clone(),
            has_consumer_secret: !config.consumer_secret.is_empty(),
            sandbox: config.sandbox,
            signer,
            credential: RwLock::new(None),
        }
    }

    fn resource_url(&self, area: &str, resource: &str) -> String {
        let (base, prefix) = if self.sandbox {
            (SANDBOX_BASE_URL, "sandbox/")
        } else {
            (LIVE_BASE_URL, "")
        };
        format!("{}/{}/{}rest/{}", base, area, prefix, resource)
    }

    async fn send(
        &self,
        operation: &str,
        method: Method,
        url: &str,
        query: Vec<(String, String)>,
        body: Option<serde_json::Value>,
        token: SigningToken<'_>,
    ) -> ApiResult<String> {
        let auth = self
            .signer
            .authorization_header(method.as_str(), url, &query, token);

        let full_url = if query.is_empty() {
            url.to_string()
        } else {
            let pairs = query
                .iter()
                .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            format!("{}?{}", url, pairs)
        };

        let mut request = self
            .client
            .request(method.clone(), &full_url)
            .header("Authorization", auth)
            .header("Accept", "application/json");

        if let Some(body) = body {
            request = request.json(&body);
        }

        let started = Instant::now();
        let result = request.send().await;
        let elapsed = started.elapsed();

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(
                    "{} {} failed after {:.3}s: {}",
                    method,
                    url,
                    elapsed.as_secs_f64(),
                    e
                );
                return Err(ApiError::connection_failed(operation, e));
            }
        };

        let status = response.status();
        let content = response
            .text()
            .await
            .map_err(|e| ApiError::connection_failed(operation, e))?;

        tracing::debug!(
            "{} {} -> {} in {:.3}s\n{}",
            method,
            url,
            status,
            elapsed.as_secs_f64(),
            content
        );

        check_status(operation, status)?;
        Ok(content)
    }

    async fn protected<T: DeserializeOwned>(
        &self,
        operation: &str,
        method: Method,
        url: String,
        query: Vec<(String, String)>,
        body: Option<serde_json::Value>,
    ) -> ApiResult<T> {
        let credential = self.credential.read().await.clone().ok_or_else(|| {
            ApiError::Unauthorized("no access token installed".to_string())
        })?;

        let content = self
            .send(
                operation,
                method,
                &url,
                query,
                body,
                SigningToken::Access(&credential),
            )
            .await?;

        serde_json::from_str(&content).map_err(|e| ApiError::decode(operation, e))
    }

    fn token_from_form(&self, content: &str) -> Option<AccessCredential> {
        let pairs = parse_form(content);
        let find = |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .filter(|v| !v.is_empty())
        };
        Some(AccessCredential::new(
            self.consumer_key.clone(),
            find("oauth_token")?,
            find("oauth_token_secret")?,
        ))
    }

    fn equity_order_body(order: &OrderRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "accountId": order.account_id,
            "clientOrderId": order.client_order_id,
            "symbol": order.symbol,
            "orderAction": order.side,
            "quantity": order.quantity,
            "orderTerm": order.order_term,
            "allOrNone": order.all_or_none,
            "marketSession": "REGULAR",
            "routingDestination": "AUTO",
        });
        if let (Some(target), Ok(serde_json::Value::Object(price))) =
            (body.as_object_mut(), serde_json::to_value(order.price_type))
        {
            target.extend(price);
        }
        body
    }
}

fn check_status(operation: &str, status: StatusCode) -> ApiResult<()> {
    if status == StatusCode::UNAUTHORIZED {
        return Err(ApiError::Unauthorized(format!(
            "{} rejected the access token",
            operation
        )));
    }
    if status != StatusCode::OK {
        return Err(ApiError::Status {
            operation: operation.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(())
}

#[derive(Deserialize)]
struct PlaceEquityOrderEnvelope {
    #[serde(rename = "PlaceEquityOrderResponse", alias = "placeChangeEquityOrderResponse")]
    response: EquityOrderResponseWrapper,
}

#[derive(Deserialize)]
struct EquityOrderResponseWrapper {
    #[serde(rename = "EquityOrderResponse", alias = "equityOrderResponse")]
    order: OrderAck,
}

#[derive(Deserialize)]
struct CancelOrderEnvelope {
    #[serde(rename = "cancelOrderResponse")]
    response: CancelOrderWrapper,
}

#[derive(Deserialize)]
struct CancelOrderWrapper {
    #[serde(rename = "cancelResponse")]
    cancel: CancelAck,
}

#[derive(Deserialize)]
struct OrderListEnvelope {
    #[serde(rename = "GetOrderListResponse")]
    response: OrderListWrapper,
}

#[derive(Deserialize)]
struct OrderListWrapper {
    #[serde(rename = "orderListResponse")]
    list: OrderListBody,
}

#[derive(Deserialize)]
struct OrderListBody {
    #[serde(default)]
    marker: Option<String>,
    #[serde(rename = "orderDetails", default)]
    details: Vec<Option<OrderDetails>>,
}

#[derive(Deserialize)]
struct OrderDetails {
    order: Option<OrderInfo>,
}

#[derive(Deserialize)]
struct AccountListEnvelope {
    #[serde(rename = "json.accountListResponse")]
    response: AccountListBody,
}

#[derive(Deserialize)]
struct AccountListBody {
    #[serde(default)]
    response: Vec<AccountInfo>,
}

#[derive(Deserialize)]
struct PositionsEnvelope {
    #[serde(rename = "json.accountPositionsResponse")]
    response: PositionsBody,
}

#[derive(Deserialize)]
struct PositionsBody {
    #[serde(default)]
    marker: Option<String>,
    #[serde(default)]
    response: Vec<PositionInfo>,
}

#[derive(Deserialize)]
struct ProductLookupEnvelope {
    #[serde(rename = "productLookupResponse")]
    response: ProductLookupBody,
}

#[derive(Deserialize)]
struct ProductLookupBody {
    #[serde(rename = "productList", default)]
    products: Vec<ProductInfo>,
}

#[derive(Deserialize)]
struct RateLimitEnvelope {
    #[serde(rename = "RateLimitStatus")]
    status: RateLimitStatus,
}

fn non_empty(marker: Option<String>) -> Option<String> {
    marker.filter(|m| !m.is_empty())
}

#[async_trait]
impl BrokerApi for EtradeClient {
    async fn set_credential(&self, credential: Option<AccessCredential>) {
        *self.credential.write().await = credential;
    }

    async fn get_request_token(&self) -> ApiResult<AccessCredential> {
        if self.consumer_key.is_empty() || !self.has_consumer_secret {
            return Err(ApiError::MissingConsumerCredentials);
        }

        let url = format!("{}/oauth/request_token", LIVE_BASE_URL);
        let content = self
            .send(
                "GetRequestToken",
                Method::GET,
                &url,
                Vec::new(),
                None,
                SigningToken::RequestToken,
            )
            .await
            .map_err(|e| ApiError::AuthorizationFailed(e.to_string()))?;

        self.token_from_form(&content).ok_or_else(|| {
            ApiError::AuthorizationFailed("request token missing from response".to_string())
        })
    }

    async fn get_access_token(
        &self,
        request_token: &AccessCredential,
        verifier: &str,
    ) -> ApiResult<AccessCredential> {
        let url = format!("{}/oauth/access_token", LIVE_BASE_URL);
        let content = self
            .send(
                "GetAccessToken",
                Method::GET,
                &url,
                Vec::new(),
                None,
                SigningToken::Verifier(request_token, verifier),
            )
            .await
            .map_err(|e| ApiError::AuthorizationFailed(e.to_string()))?;

        self.token_from_form(&content).ok_or_else(|| {
            ApiError::AuthorizationFailed("access token missing from response".to_string())
        })
    }

    async fn renew_access_token(
        &self,
        access_token: &AccessCredential,
    ) -> ApiResult<AccessCredential> {
        let url = format!("{}/oauth/renew_access_token", LIVE_BASE_URL);
        let content = self
            .send(
                "RenewAccessToken",
                Method::GET,
                &url,
                Vec::new(),
                None,
                SigningToken::Access(access_token),
            )
            .await
            .map_err(|e| ApiError::RenewFailed(e.to_string()))?;

        // A renewal that does not rotate the token keeps the old one alive.
        Ok(self
            .token_from_form(&content)
            .unwrap_or_else(|| access_token.clone()))
    }

    fn authorize_url(&self, request_token: &AccessCredential) -> String {
        format!(
            "{}?key={}&token={}",
            AUTHORIZE_URL,
            self.consumer_key,
            request_token.token()
        )
    }

    async fn send_order(&self, order: &OrderRequest) -> ApiResult<OrderAck> {
        let body = serde_json::json!({
            "PlaceEquityOrder": { "EquityOrderRequest": Self::equity_order_body(order) }
        });
        let envelope: PlaceEquityOrderEnvelope = self
            .protected(
                "SendOrder",
                Method::POST,
                self.resource_url("order", "placeequityorder.json"),
                Vec::new(),
                Some(body),
            )
            .await?;
        Ok(envelope.response.order)
    }

    async fn change_order(&self, order_id: i64, order: &OrderRequest) -> ApiResult<OrderAck> {
        let mut request = Self::equity_order_body(order);
        request["orderNum"] = serde_json::json!(order_id);
        let body = serde_json::json!({
            "placeChangeEquityOrder": { "changeEquityOrderRequest": request }
        });
        let envelope: PlaceEquityOrderEnvelope = self
            .protected(
                "SendOrderChange",
                Method::POST,
                self.resource_url("order", "placechangeequityorder.json"),
                Vec::new(),
                Some(body),
            )
            .await?;
        Ok(envelope.response.order)
    }

    async fn cancel_order(&self, order_id: i64, portfolio: &str) -> ApiResult<CancelAck> {
        let body = serde_json::json!({
            "cancelOrder": {
                "cancelOrderRequest": { "orderNum": order_id, "accountId": portfolio }
            }
        });
        let envelope: CancelOrderEnvelope = self
            .protected(
                "CancelOrder",
                Method::POST,
                self.resource_url("order", "cancelorder.json"),
                Vec::new(),
                Some(body),
            )
            .await?;
        Ok(envelope.response.cancel)
    }

    async fn get_order_list(
        &self,
        portfolio: &str,
        count: u32,
        marker: Option<String>,
    ) -> ApiResult<Page<OrderInfo>> {
        let mut query = vec![("count".to_string(), count.to_string())];
        if let Some(marker) = non_empty(marker) {
            query.push(("marker".to_string(), marker));
        }

        let envelope: OrderListEnvelope = self
            .protected(
                "GetOrderList",
                Method::GET,
                self.resource_url("order", &format!("orderlist/{}.json", portfolio)),
                query,
                None,
            )
            .await?;

        let list = envelope.response.list;
        Ok(Page {
            items: list
                .details
                .into_iter()
                .flatten()
                .filter_map(|d| d.order)
                .collect(),
            next: non_empty(list.marker),
        })
    }

    async fn get_positions(
        &self,
        portfolio: &str,
        marker: Option<String>,
    ) -> ApiResult<Page<PositionInfo>> {
        let mut query = vec![("count".to_string(), MAX_POSITIONS_PER_PAGE.to_string())];
        if let Some(marker) = non_empty(marker) {
            query.push(("marker".to_string(), marker));
        }

        let envelope: PositionsEnvelope = self
            .protected(
                "AccountPositions",
                Method::GET,
                self.resource_url("accounts", &format!("accountpositions/{}.json", portfolio)),
                query,
                None,
            )
            .await?;

        Ok(Page {
            items: envelope.response.response,
            next: non_empty(envelope.response.marker),
        })
    }

    async fn get_accounts(&self) -> ApiResult<Vec<AccountInfo>> {
        let envelope: AccountListEnvelope = self
            .protected(
                "GetAccounts",
                Method::GET,
                self.resource_url("accounts", "accountlist.json"),
                Vec::new(),
                None,
            )
            .await?;
        Ok(envelope.response.response)
    }

    async fn product_lookup(&self, company: &str) -> ApiResult<Vec<ProductInfo>> {
        let query = vec![
            ("company".to_string(), company.to_string()),
            ("type".to_string(), "EQ".to_string()),
        ];
        let envelope: ProductLookupEnvelope = self
            .protected(
                "ProductLookup",
                Method::GET,
                self.resource_url("market", "productlookup.json"),
                query,
                None,
            )
            .await?;
        Ok(envelope.response.products)
    }

    async fn get_rate_limit_status(&self, module: &str) -> ApiResult<RateLimitStatus> {
        let query = vec![("module".to_string(), module.to_string())];
        let envelope: RateLimitEnvelope = self
            .protected(
                "GetRateLimitStatus",
                Method::GET,
                self.resource_url("statuses", "limits.json"),
                query,
                None,
            )
            .await?;
        Ok(envelope.status)
    }
}
