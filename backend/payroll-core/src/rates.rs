// src/rates.rs
//
// Pure salary arithmetic: rate derivation and allowance/deduction aggregation.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{LineItem, LineItemKind};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateError {
    #[error("Base salary must be greater than zero (got {0})")]
    NonPositiveBaseSalary(Decimal),
    #[error("Working days must be greater than zero (got {0})")]
    NonPositiveWorkingDays(Decimal),
    #[error("Daily hours must be greater than zero (got {0})")]
    NonPositiveDailyHours(Decimal),
    #[error("Rate calculation overflowed")]
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedRates {
    pub daily_rate: Decimal,
    pub hourly_rate: Decimal,
    pub overtime_rate: Decimal,
}

/// Two-decimal rounding used for every displayed or stored amount.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Derives daily, hourly and overtime rates from a monthly base salary.
///
/// Intermediate values keep full precision; only the three outputs are rounded. The overtime
/// multiplier is not range-checked here, form validation owns that.
pub fn derive_rates(
    base_salary: Decimal,
    working_days: Decimal,
    daily_hours: Decimal,
    overtime_multiplier: Decimal,
) -> Result<DerivedRates, RateError> {
    if base_salary <= Decimal::ZERO {
        return Err(RateError::NonPositiveBaseSalary(base_salary));
    }
    if working_days <= Decimal::ZERO {
        return Err(RateError::NonPositiveWorkingDays(working_days));
    }
    if daily_hours <= Decimal::ZERO {
        return Err(RateError::NonPositiveDailyHours(daily_hours));
    }

    let daily = base_salary
        .checked_div(working_days)
        .ok_or(RateError::Overflow)?;
    let hourly = daily.checked_div(daily_hours).ok_or(RateError::Overflow)?;
    let overtime = hourly
        .checked_mul(overtime_multiplier)
        .ok_or(RateError::Overflow)?;

    Ok(DerivedRates {
        daily_rate: round_money(daily),
        hourly_rate: round_money(hourly),
        overtime_rate: round_money(overtime),
    })
}

/// Contribution of a single line item against `base_salary`. Items without a usable amount
/// contribute zero.
pub fn line_item_value(item: &LineItem, base_salary: Decimal) -> Result<Decimal, RateError> {
    let Some(amount) = item.amount else {
        return Ok(Decimal::ZERO);
    };
    match item.kind {
        LineItemKind::Fixed => Ok(amount),
        LineItemKind::Percentage => percent_of(base_salary, amount),
    }
}

pub fn sum_line_items(items: &[LineItem], base_salary: Decimal) -> Result<Decimal, RateError> {
    items.iter().try_fold(Decimal::ZERO, |total, item| {
        total
            .checked_add(line_item_value(item, base_salary)?)
            .ok_or(RateError::Overflow)
    })
}

fn percent_of(value: Decimal, percent: Decimal) -> Result<Decimal, RateError> {
    value
        .checked_mul(percent)
        .and_then(|v| v.checked_div(dec!(100)))
        .ok_or(RateError::Overflow)
}

/// Informational net salary figure shown next to the configuration form. The server's
/// calculation is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NetSalaryEstimate {
    pub base_salary: Decimal,
    pub allowances: Decimal,
    pub deductions: Decimal,
    pub tax: Decimal,
    pub social_security: Decimal,
    pub net: Decimal,
}

pub fn estimate_net_salary(
    base_salary: Decimal,
    allowances: &[LineItem],
    deductions: &[LineItem],
    tax_rate: Decimal,
    social_security_rate: Decimal,
) -> Result<NetSalaryEstimate, RateError> {
    let allowance_total = sum_line_items(allowances, base_salary)?;
    let deduction_total = sum_line_items(deductions, base_salary)?;
    let tax = percent_of(base_salary, tax_rate)?;
    let social_security = percent_of(base_salary, social_security_rate)?;
    let net = base_salary
        .checked_add(allowance_total)
        .and_then(|v| v.checked_sub(deduction_total))
        .and_then(|v| v.checked_sub(tax))
        .and_then(|v| v.checked_sub(social_security))
        .ok_or(RateError::Overflow)?;

    Ok(NetSalaryEstimate {
        base_salary,
        allowances: round_money(allowance_total),
        deductions: round_money(deduction_total),
        tax: round_money(tax),
        social_security: round_money(social_security),
        net: round_money(net),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_reference_rates() {
        let rates = derive_rates(dec!(3000), dec!(22), dec!(8), dec!(1.5)).unwrap();
        assert_eq!(rates.daily_rate, dec!(136.36));
        assert_eq!(rates.hourly_rate, dec!(17.05));
        assert_eq!(rates.overtime_rate, dec!(25.57));
    }

    #[test]
    fn rates_follow_the_unrounded_chain() {
        let samples = [
            (dec!(3000), dec!(22), dec!(8), dec!(1.5)),
            (dec!(250000), dec!(26), dec!(7.5), dec!(2)),
            (dec!(1234.56), dec!(21.5), dec!(8), dec!(1.25)),
            (dec!(999999), dec!(31), dec!(24), dec!(3)),
            (dec!(100), dec!(1), dec!(1), dec!(1)),
        ];
        for (base, days, hours, multiplier) in samples {
            let rates = derive_rates(base, days, hours, multiplier).unwrap();
            let daily = base / days;
            let hourly = daily / hours;
            assert_eq!(rates.daily_rate, round_money(daily));
            assert_eq!(rates.hourly_rate, round_money(daily / hours));
            assert_eq!(rates.overtime_rate, round_money(hourly * multiplier));
        }
    }

    #[test]
    fn rejects_non_positive_inputs() {
        assert_eq!(
            derive_rates(dec!(0), dec!(22), dec!(8), dec!(1.5)),
            Err(RateError::NonPositiveBaseSalary(dec!(0)))
        );
        assert_eq!(
            derive_rates(dec!(3000), dec!(-1), dec!(8), dec!(1.5)),
            Err(RateError::NonPositiveWorkingDays(dec!(-1)))
        );
        assert_eq!(
            derive_rates(dec!(3000), dec!(22), dec!(0), dec!(1.5)),
            Err(RateError::NonPositiveDailyHours(dec!(0)))
        );
    }

    #[test]
    fn sums_fixed_and_percentage_items() {
        let items = vec![
            LineItem::fixed("Transport", dec!(100)),
            LineItem::percentage("Housing", dec!(10)),
        ];
        assert_eq!(sum_line_items(&items, dec!(1000)).unwrap(), dec!(200));
    }

    #[test]
    fn items_without_amount_contribute_nothing() {
        let items: Vec<LineItem> = serde_json::from_str(
            r#"[{"name":"a","amount":"abc","type":"fixed"},
                {"name":"b","type":"percentage"},
                {"name":"c","amount":50,"type":"fixed"}]"#,
        )
        .unwrap();
        assert_eq!(sum_line_items(&items, dec!(1000)).unwrap(), dec!(50));
        assert_eq!(sum_line_items(&[], dec!(1000)).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn repeated_percentages_do_not_drift() {
        let items: Vec<LineItem> = (0..10)
            .map(|i| LineItem::percentage(&format!("p{}", i), dec!(0.1)))
            .collect();
        assert_eq!(sum_line_items(&items, dec!(3)).unwrap(), dec!(0.03));
    }

    #[test]
    fn net_estimate_combines_all_components() {
        let estimate = estimate_net_salary(
            dec!(1000),
            &[LineItem::fixed("Transport", dec!(100))],
            &[LineItem::percentage("Loan", dec!(5))],
            dec!(10),
            dec!(5.5),
        )
        .unwrap();
        assert_eq!(estimate.allowances, dec!(100));
        assert_eq!(estimate.deductions, dec!(50));
        assert_eq!(estimate.tax, dec!(100));
        assert_eq!(estimate.social_security, dec!(55));
        assert_eq!(estimate.net, dec!(895));
    }

    #[test]
    fn oversized_amounts_report_overflow() {
        assert_eq!(
            estimate_net_salary(Decimal::MAX, &[], &[], dec!(10), dec!(0)),
            Err(RateError::Overflow)
        );
        assert_eq!(
            sum_line_items(
                &[LineItem::fixed("a", Decimal::MAX), LineItem::fixed("b", Decimal::MAX)],
                dec!(1000)
            ),
            Err(RateError::Overflow)
        );
        assert_eq!(
            line_item_value(&LineItem::percentage("p", dec!(50)), Decimal::MAX),
            Err(RateError::Overflow)
        );
    }
}
