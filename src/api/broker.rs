use async_trait::async_trait;

use super::error::ApiResult;
use super::types::*;
use crate::connection::AccessCredential;

/// The broker's REST surface as seen by the scheduler.
///
/// Every method is one wire call. Paginated listings take the marker returned
/// by the previous page and hand back the next one inside [`Page`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// Installs (or clears) the credential used to sign protected calls.
    async fn set_credential(&self, credential: Option<AccessCredential>);

    async fn get_request_token(&self) -> ApiResult<AccessCredential>;

    async fn get_access_token(
        &self,
        request_token: &AccessCredential,
        verifier: &str,
    ) -> ApiResult<AccessCredential>;

    async fn renew_access_token(&self, access_token: &AccessCredential)
        -> ApiResult<AccessCredential>;

    fn authorize_url(&self, request_token: &AccessCredential) -> String;

    async fn send_order(&self, order: &OrderRequest) -> ApiResult<OrderAck>;

    async fn change_order(&self, order_id: i64, order: &OrderRequest) -> ApiResult<OrderAck>;

    async fn cancel_order(&self, order_id: i64, portfolio: &str) -> ApiResult<CancelAck>;

    async fn get_order_list(
        &self,
        portfolio: &str,
        count: u32,
        marker: Option<String>,
    ) -> ApiResult<Page<OrderInfo>>;

    async fn get_positions(
        &self,
        portfolio: &str,
        marker: Option<String>,
    ) -> ApiResult<Page<PositionInfo>>;

    async fn get_accounts(&self) -> ApiResult<Vec<AccountInfo>>;

    async fn product_lookup(&self, company: &str) -> ApiResult<Vec<ProductInfo>>;

    async fn get_rate_limit_status(&self, module: &str) -> ApiResult<RateLimitStatus>;
}
