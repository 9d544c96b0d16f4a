//! Bundled functions and the example sample set

pub mod add;
pub mod date;
pub mod persona;

use std::sync::Arc;

pub use add::add;
pub use date::CurrentDate;
pub use persona::SendMessage;

use crate::error::Result;
use crate::function::{Function, FunctionSet};
use crate::gateway::SharedGateway;
use crate::sample::{Expected, QuizItem, Sample};

/// The example samples. `Send Message` personas talk through `gateway` with `model`.
pub fn samples(gateway: &SharedGateway, model: &str) -> Result<Vec<Sample>> {
    let add: Arc<dyn Function> = Arc::new(add());
    let friend: Arc<dyn Function> = Arc::new(SendMessage::new(
        "Say that you recently moved to San Francisco.",
        gateway.clone(),
        model,
    ));
    let today: Arc<dyn Function> = Arc::new(CurrentDate);

    Ok(vec![
        Sample::new(
            "Add two numbers",
            "What is 1782937829 + 973912412?",
            FunctionSet::new(vec![add.clone()]),
            Expected {
                functions: vec![add.slug()],
                quiz: vec![
                    QuizItem::new("What is the first term?", "1782937829"),
                    QuizItem::new("What is the second term?", "973912412"),
                    QuizItem::new("What is the sum?", "2756850241"),
                ],
            },
        )?,
        Sample::new(
            "Message Friend",
            "Send a message to your friend asking them how they are doing.",
            FunctionSet::new(vec![friend.clone()]),
            Expected {
                functions: vec![friend.slug()],
                quiz: vec![QuizItem::new("In what city does the friend live?", "San Francisco")],
            },
        )?,
        Sample::new(
            "Day of the week",
            "Find out which day of the week it is today.",
            FunctionSet::new(vec![today.clone(), add]),
            Expected {
                functions: vec![today.slug()],
                quiz: vec![QuizItem::new("What day of the week is it?", "Sunday")],
            },
        )?,
    ])
}
