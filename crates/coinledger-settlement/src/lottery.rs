//! Block-hash lottery.
//!
//! A ticket costs a fixed price: the jackpot share moves to the lottery
//! account and the rest is kept as a house cut. Each ticket is a task that
//! the next draw completes. A draw happens once the chain reaches
//! `last height + interval`; the last byte of that block's hash is the
//! winning value. When the jackpot holds fewer than the configured number
//! of tickets, the feeder buys bot tickets for the difference.
//!
//! Winners split the jackpot equally, bot winners' shares go back to the
//! feeder, and truncation dust stays for the next round. Without a winner
//! the whole jackpot carries over. Every draw batch carries
//! `lottery:{height}` as its audit reference, so the last drawn height is
//! rebuilt from the audit log after a restart.

use std::sync::{MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use coinledger_types::{
    AccountId, Bucket, CoinledgerError, DrainReport, LotteryDraw, LotteryTicketBought, OpTag,
    Result, TaskId, TaskKind, TaskPayload, WalletKind, amount::truncate,
};
use rand::Rng;
use rust_decimal::Decimal;

use crate::{pipeline::Pipeline, task_store::TaskDraft};

const REFERENCE_PREFIX: &str = "lottery:";

/// The winning value encoded in a block hash: its last byte.
fn winning_value(block_hash: &str) -> Result<u8> {
    let tail = block_hash
        .len()
        .checked_sub(2)
        .and_then(|at| block_hash.get(at..))
        .ok_or_else(|| CoinledgerError::Internal(format!("block hash too short: {block_hash:?}")))?;
    u8::from_str_radix(tail, 16)
        .map_err(|e| CoinledgerError::Internal(format!("block hash {block_hash:?}: {e}")))
}

impl Pipeline {
    // =================================================================
    // Tickets
    // =================================================================

    /// Pay for one ticket betting on `value`.
    pub fn buy_lottery_ticket(
        &self,
        account: AccountId,
        value: u8,
        now: DateTime<Utc>,
    ) -> Result<LotteryTicketBought> {
        if account.is_system() {
            return Err(CoinledgerError::invalid(format!("{account} cannot play the lottery")));
        }
        let price = self.config.lottery_ticket_price;
        let share = truncate(price * self.config.lottery_jackpot_share);
        let cut = price - share;

        let draft = TaskDraft::new(account, price, TaskPayload::LotteryTicket { value }, now);
        let (tasks, jackpot) = self.tasks.enqueue_with(vec![draft], |_, ids| {
            self.ledger.batch(&[account, AccountId::LOTTERY], |b| {
                b.set_reference(ids[0].to_string());
                let available = b.balance(account, Bucket::Native)?;
                if available < price {
                    return Err(CoinledgerError::InsufficientFunds {
                        account,
                        bucket: Bucket::Native,
                        needed: price,
                        available,
                    });
                }
                b.transfer(account, AccountId::LOTTERY, Bucket::Native, share, OpTag::LotteryTicket)?;
                b.debit(account, Bucket::Native, cut, OpTag::LotteryHouseCut)?;
                b.balance(AccountId::LOTTERY, Bucket::Native)
            })
        })?;
        let task = tasks[0].id;
        tracing::info!(account = %account, task = %task, value, jackpot = %jackpot, "lottery ticket bought");
        Ok(LotteryTicketBought { task, value, jackpot })
    }

    #[must_use]
    pub fn lottery_tickets(&self) -> Vec<TaskId> {
        self.tasks
            .pending(TaskKind::LotteryTicket)
            .iter()
            .map(|t| t.id)
            .collect()
    }

    pub fn lottery_jackpot(&self) -> Result<Decimal> {
        self.ledger.balance(AccountId::LOTTERY, Bucket::Native)
    }

    // =================================================================
    // Draw
    // =================================================================

    fn load_lottery_height(&self) -> Result<Option<u64>> {
        Ok(self
            .ledger
            .audit_entries()?
            .into_iter()
            .filter_map(|e| e.reference?.strip_prefix(REFERENCE_PREFIX)?.parse::<u64>().ok())
            .max())
    }

    /// Last drawn height, rebuilt on first use. With nothing in the audit
    /// log the lottery starts from `tip`.
    fn lottery_height(&self, tip: u64) -> Result<MutexGuard<'_, Option<u64>>> {
        let mut guard = self
            .lottery_height
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(self.load_lottery_height()?.unwrap_or(tip));
        }
        Ok(guard)
    }

    /// Draw once the chain has reached the next lottery block.
    ///
    /// Returns `None` when that block does not exist yet or nobody holds a
    /// ticket; in the latter case the round is skipped and the next draw
    /// counts from the current tip.
    ///
    /// # Errors
    /// Native wallet unreachable, or a ledger failure. Tickets stay pending
    /// and the drawn height is not advanced.
    pub fn draw_lottery(&self, now: DateTime<Utc>) -> Result<Option<LotteryDraw>> {
        let wallet = self.wallet(WalletKind::Native);
        let tip = wallet
            .block_count()
            .map_err(|e| CoinledgerError::from_gateway("native", e))?;
        let mut last = self.lottery_height(tip)?;
        let height = last.unwrap_or(tip) + self.config.lottery_block_interval;
        if tip < height {
            return Ok(None);
        }

        let tickets = self.tasks.pending(TaskKind::LotteryTicket);
        if tickets.is_empty() {
            *last = Some(tip);
            return Ok(None);
        }
        let block_hash = wallet
            .block_hash(height)
            .map_err(|e| CoinledgerError::from_gateway("native", e))?;
        let winning = winning_value(&block_hash)?;

        let price = self.config.lottery_ticket_price;
        let min_tickets = Decimal::from(self.config.lottery_min_jackpot_tickets);
        let ids: Vec<TaskId> = tickets.iter().map(|t| t.id).collect();
        let mut accounts: Vec<AccountId> = tickets.iter().map(|t| t.owner).collect();
        accounts.extend([AccountId::LOTTERY, AccountId::FEEDER]);

        let draw = self.tasks.settle_all(&ids, now, |tickets| {
            self.ledger.batch(&accounts, |b| {
                b.set_reference(format!("{REFERENCE_PREFIX}{height}"));
                let jackpot = b.balance(AccountId::LOTTERY, Bucket::Native)?;
                let short = (min_tickets - (jackpot / price).floor()).max(Decimal::ZERO);
                let mut bots = Vec::new();
                let mut rng = rand::thread_rng();
                while Decimal::from(bots.len()) < short {
                    if b.balance(AccountId::FEEDER, Bucket::Native)? < price {
                        tracing::debug!(bots = bots.len(), "feeder short, fewer bot tickets");
                        break;
                    }
                    b.transfer(
                        AccountId::FEEDER,
                        AccountId::LOTTERY,
                        Bucket::Native,
                        price,
                        OpTag::LotteryBotTicket,
                    )?;
                    bots.push(rng.gen_range(0..=u8::MAX));
                }

                let winners: Vec<AccountId> = tickets
                    .iter()
                    .filter(|t| matches!(t.payload, TaskPayload::LotteryTicket { value } if value == winning))
                    .map(|t| t.owner)
                    .collect();
                let bot_winners = bots.iter().filter(|v| **v == winning).count();
                let jackpot = b.balance(AccountId::LOTTERY, Bucket::Native)?;
                let count = winners.len() + bot_winners;
                let win_amount = if count == 0 {
                    Decimal::ZERO
                } else {
                    truncate(jackpot / Decimal::from(count))
                };
                for winner in &winners {
                    b.transfer(AccountId::LOTTERY, *winner, Bucket::Native, win_amount, OpTag::LotteryPayout)?;
                }
                b.transfer(
                    AccountId::LOTTERY,
                    AccountId::FEEDER,
                    Bucket::Native,
                    win_amount * Decimal::from(bot_winners),
                    OpTag::LotteryPayout,
                )?;
                Ok(LotteryDraw {
                    height,
                    block_hash: block_hash.clone(),
                    winning_value: winning,
                    tickets: tickets.len(),
                    winners,
                    bot_tickets: bots.len(),
                    bot_winners,
                    win_amount,
                    jackpot_after: b.balance(AccountId::LOTTERY, Bucket::Native)?,
                })
            })
        })?;
        *last = Some(tip);
        tracing::info!(
            height,
            winning_value = draw.winning_value,
            tickets = draw.tickets,
            bots = draw.bot_tickets,
            winners = draw.winners.len() + draw.bot_winners,
            win_amount = %draw.win_amount,
            jackpot = %draw.jackpot_after,
            "lottery drawn"
        );
        Ok(Some(draw))
    }

    pub(crate) fn drain_lottery(&self, now: DateTime<Utc>) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        if let Some(draw) = self.draw_lottery(now)? {
            report.examined = draw.tickets;
            report.completed = report.examined;
        }
        Ok(report)
    }
}
