use cozymail_core::{Account, FetchedMessage, FilterRule};
use cozymail_filter::{RuleMatch, SpamVerdict, evaluate, is_whitelisted, spam_level};

pub(crate) const SPAM_LEVEL_HEADER: &str = "X-Spam-Level";

/// Where one newly seen message ends up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// A user rule claimed it; it is moved and never cached.
    Route(RuleMatch),
    /// Kept in the inbox and cached unread.
    Accept { whitelisted: bool },
    /// Moved to the junk folder and never cached.
    Junk(SpamVerdict),
}

/// Rules first, then the whitelist. `None` means the message goes on to
/// the spam verdict; the model is never consulted for a screened message.
pub(crate) fn screen(
    message: &FetchedMessage,
    rules: &[FilterRule],
    whitelist: &[String],
) -> Option<Disposition> {
    if let Some(hit) = evaluate(rules, message) {
        return Some(Disposition::Route(hit));
    }
    if is_whitelisted(
        &message.sender_address,
        whitelist.iter().map(String::as_str),
    ) {
        return Some(Disposition::Accept { whitelisted: true });
    }
    None
}

/// Whether the model's opinion is wanted for this account.
pub(crate) fn wants_model(account: &Account) -> bool {
    account.classification_enabled
}

/// Header score OR model. `model_says_spam` is ignored when classification
/// is disabled for the account.
pub(crate) fn judge(message: &FetchedMessage, account: &Account, model_says_spam: bool) -> Disposition {
    let verdict = SpamVerdict {
        level: spam_level(message.header(SPAM_LEVEL_HEADER)),
        threshold: account.spam_threshold(),
        model_says_spam: wants_model(account) && model_says_spam,
    };
    if verdict.is_spam() {
        Disposition::Junk(verdict)
    } else {
        Disposition::Accept { whitelisted: false }
    }
}
