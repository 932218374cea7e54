pub mod dividends;
pub mod guard;
pub mod sales;

pub use dividends::{calculate_dividends, DividendRecord, DividendReport};
pub use guard::unsupported_activity_types;
pub use sales::{calculate_sales, win_loss, CalculationError, SaleMatchRecord, SalesReport};
