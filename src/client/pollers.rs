use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use super::events::{ClientEvent, EventBus};
use super::portfolios::PortfolioBook;
use crate::api::PositionInfo;
use crate::engine::operations::{AccountsOp, OrderListOp, PositionsOp};
use crate::engine::{AutoRequestSource, Executable, ModuleWaker, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccountsStep {
    Accounts,
    Positions(usize),
}

/// Auto generator of the accounts module.
///
/// Cycles the account list, then the positions of every known portfolio.
pub struct AccountsPoller {
    book: Arc<PortfolioBook>,
    events: EventBus,
    orders: Option<ModuleWaker>,
    step: AccountsStep,
}

impl AccountsPoller {
    pub fn new(book: Arc<PortfolioBook>, events: EventBus, orders: Option<ModuleWaker>) -> Self {
        Self {
            book,
            events,
            orders,
            step: AccountsStep::Accounts,
        }
    }

    fn accounts_request(&self) -> Box<dyn Executable> {
        let book = self.book.clone();
        let events = self.events.clone();
        let orders = self.orders.clone();

        Request::with_handler(AccountsOp, move |response| match response.result {
            Ok(accounts) => {
                let mut discovered = false;
                for account in &accounts {
                    if book.add(&account.account_id) {
                        debug!("Discovered portfolio {}", account.account_id);
                        discovered = true;
                    }
                }
                if discovered {
                    if let Some(orders) = &orders {
                        orders.wake();
                    }
                }
                events.publish(ClientEvent::AccountsData {
                    accounts,
                    error: None,
                });
            }
            Err(error) => events.publish(ClientEvent::AccountsData {
                accounts: Vec::new(),
                error: Some(error),
            }),
        })
        .boxed()
    }
}

impl AutoRequestSource for AccountsPoller {
    fn next_request(&mut self) -> Option<Box<dyn Executable>> {
        if let AccountsStep::Positions(index) = self.step {
            if let Some(portfolio) = self.book.ids().into_iter().nth(index) {
                self.step = AccountsStep::Positions(index + 1);
                return Some(positions_request(portfolio, self.events.clone()));
            }
        }
        self.step = AccountsStep::Positions(0);
        Some(self.accounts_request())
    }

    fn restart(&mut self) {
        self.step = AccountsStep::Accounts;
    }
}

/// Positions of one portfolio, published once the last page is in.
pub fn positions_request(portfolio: String, events: EventBus) -> Box<dyn Executable> {
    let collected: Mutex<Vec<PositionInfo>> = Mutex::new(Vec::new());
    let op = PositionsOp::new(portfolio.clone());

    Request::with_handler(op, move |response| match response.result {
        Ok(page) => {
            let mut collected = collected.lock();
            collected.extend(page);
            if response.is_last {
                events.publish(ClientEvent::PositionsData {
                    portfolio: portfolio.clone(),
                    positions: std::mem::take(&mut *collected),
                    error: None,
                });
            }
        }
        Err(error) => {
            collected.lock().clear();
            events.publish(ClientEvent::PositionsData {
                portfolio: portfolio.clone(),
                positions: Vec::new(),
                error: Some(error),
            });
        }
    })
    .boxed()
}

/// Auto generator of the orders module: round-robin over active portfolios.
pub struct OrdersPoller {
    book: Arc<PortfolioBook>,
    events: EventBus,
    current: Option<String>,
}

impl OrdersPoller {
    pub fn new(book: Arc<PortfolioBook>, events: EventBus) -> Self {
        Self {
            book,
            events,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }
}

impl AutoRequestSource for OrdersPoller {
    fn next_request(&mut self) -> Option<Box<dyn Executable>> {
        let (portfolio, cursor) = self.book.next_active_after(self.current.as_deref())?;
        self.current = Some(portfolio.clone());

        let book = self.book.clone();
        let events = self.events.clone();
        let collected = Mutex::new(Vec::new());
        let activity = cursor.activity;
        let op = OrderListOp::new(portfolio.clone(), cursor.count, cursor.oldest_incomplete);

        Some(
            Request::with_handler(op, move |response| match response.result {
                Ok(part) => {
                    let mut collected = collected.lock();
                    collected.extend(part.orders);
                    if let Some(summary) = part.summary {
                        book.apply_summary(&portfolio, activity, summary);
                        events.publish(ClientEvent::OrdersData {
                            portfolio: portfolio.clone(),
                            orders: std::mem::take(&mut *collected),
                            error: None,
                        });
                    }
                }
                Err(error) => {
                    collected.lock().clear();
                    events.publish(ClientEvent::OrdersData {
                        portfolio: portfolio.clone(),
                        orders: Vec::new(),
                        error: Some(error),
                    });
                }
            })
            .boxed(),
        )
    }

    fn restart(&mut self) {
        self.current = None;
    }
}
