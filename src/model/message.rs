use crate::model::order::Order;
use crate::model::patient::Patient;
use crate::model::result::TestResult;
use crate::protocol::error::{ProtocolError, Result};

/// One `Order` and the zero or more `Result`s/comments the decoder has bound
/// to it so far.
#[derive(Debug, Clone, Default)]
pub struct OrderGroup {
    pub order: Order,
    pub results: Vec<TestResult>,
    pub comments: Vec<String>,
}

impl OrderGroup {
    fn new(order: Order) -> Self {
        Self {
            order,
            results: Vec::new(),
            comments: Vec::new(),
        }
    }
}

/// A protocol-neutral message assembled from a record stream: exactly one
/// `Patient` and an ordered sequence of `Order`s, each carrying its own
/// `Result`s and comments in wire order.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub source_analyzer: String,
    pub patient: Option<Patient>,
    pub orders: Vec<OrderGroup>,
    /// `Q` records: recorded but never acted upon (host-query support is out
    /// of scope for this service).
    pub queries: Vec<String>,
    pub finalized: bool,
}

impl Message {
    pub fn new(source_analyzer: impl Into<String>) -> Self {
        Self {
            source_analyzer: source_analyzer.into(),
            ..Default::default()
        }
    }

    pub fn set_patient(&mut self, patient: Patient) {
        self.patient = Some(patient);
    }

    pub fn push_order(&mut self, order: Order) {
        self.orders.push(OrderGroup::new(order));
    }

    /// Attach a result to the most recently opened order. Field-mapping
    /// failures for a single record are handled by the caller (drop the
    /// record, keep the rest of the Message), so this only fails when there
    /// is no open order to attach to — a genuinely malformed stream.
    pub fn push_result(&mut self, result: TestResult) -> Result<()> {
        match self.orders.last_mut() {
            Some(group) => {
                group.results.push(result);
                Ok(())
            }
            None => Err(ProtocolError::InvalidRecordFormat(
                "result record with no preceding order".into(),
            )),
        }
    }

    /// A comment attaches to the nearest preceding order (and, through it,
    /// whichever result was most recently added to that order).
    pub fn push_comment(&mut self, text: String) {
        if let Some(group) = self.orders.last_mut() {
            group.comments.push(text);
        }
    }

    pub fn push_query(&mut self, text: String) {
        self.queries.push(text);
    }

    pub fn finalize(&mut self) {
        self.finalized = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comment_attaches_to_latest_order() {
        let mut msg = Message::new("SYSMEX");
        msg.push_order(Order::new("SID01".into(), "322288".into()));
        msg.push_comment("note".into());
        assert_eq!(msg.orders[0].comments, vec!["note".to_string()]);
    }

    #[test]
    fn result_without_order_is_rejected() {
        let mut msg = Message::new("SYSMEX");
        let result = TestResult::new("GLU".into(), "5.3".into(), String::new());
        assert!(msg.push_result(result).is_err());
    }
}
