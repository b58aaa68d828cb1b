use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;

use super::{AuthorityError, TaxAuthority, VatCheck};
use crate::config::ViesSettings;
use crate::model::TaxIdDetail;

/// SOAP client for the EU VIES `checkVat` service.
pub struct ViesClient {
    http: Client,
    endpoint: String,
    parser: ResponseParser,
}

/// Regex-based reader for `checkVatResponse` and SOAP fault bodies.
struct ResponseParser {
    fault: Regex,
    leaf: Regex,
}

impl ResponseParser {
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            fault: Regex::new(r"<faultstring>\s*([^<]*?)\s*</faultstring>")?,
            leaf: Regex::new(r"<(?:[A-Za-z0-9_]+:)?([A-Za-z0-9_]+)>([^<]*)</(?:[A-Za-z0-9_]+:)?[A-Za-z0-9_]+>")?,
        })
    }

    fn parse(&self, body: &str) -> Result<VatCheck, AuthorityError> {
        if let Some(cap) = self.fault.captures(body) {
            let fault = cap[1].trim().to_string();
            return Err(if fault == "INVALID_INPUT" {
                AuthorityError::InvalidInput
            } else {
                AuthorityError::Fault(fault)
            });
        }
        let Some(start) = body.find("checkVatResponse") else {
            return Err(AuthorityError::Fault("response has no checkVatResponse".into()));
        };
        let detail: TaxIdDetail = self
            .leaf
            .captures_iter(&body[start..])
            .map(|cap| (cap[1].to_string(), unescape(&cap[2])))
            .collect();
        match detail.get("valid").map(String::as_str) {
            Some("true") => Ok(VatCheck::Valid(detail)),
            Some(_) => Ok(VatCheck::NotValid),
            None => Err(AuthorityError::Fault("response has no valid flag".into())),
        }
    }
}

fn envelope(country_code: &str, number: &str) -> String {
    format!(
        concat!(
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" "#,
            r#"xmlns:urn="urn:ec.europa.eu:taxud:vies:services:checkVat:types">"#,
            "<soapenv:Header/><soapenv:Body><urn:checkVat>",
            "<urn:countryCode>{}</urn:countryCode><urn:vatNumber>{}</urn:vatNumber>",
            "</urn:checkVat></soapenv:Body></soapenv:Envelope>"
        ),
        country_code, number
    )
}

fn unescape(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}

impl ViesClient {
    pub fn new(settings: &ViesSettings) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(settings.attempt_timeout)
            .build()
            .context("building vies http client")?;
        Ok(Self {
            http,
            endpoint: settings.endpoint.clone(),
            parser: ResponseParser::new().context("compiling vies response patterns")?,
        })
    }
}

#[async_trait]
impl TaxAuthority for ViesClient {
    async fn check_vat(&self, country_code: &str, number: &str) -> Result<VatCheck, AuthorityError> {
        let resp = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", "")
            .body(envelope(country_code, number))
            .send()
            .await
            .map_err(|e| AuthorityError::Transport(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| AuthorityError::Transport(e.to_string()))?;
        // Faults arrive with a 500 status, so look at the body first.
        match self.parser.parse(&body) {
            Err(AuthorityError::Fault(_)) if !status.is_success() && !body.contains("faultstring") => {
                Err(AuthorityError::Transport(format!("http status {status}")))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID: &str = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body>
<ns2:checkVatResponse xmlns:ns2="urn:ec.europa.eu:taxud:vies:services:checkVat:types">
<ns2:countryCode>AT</ns2:countryCode><ns2:vatNumber>U12345678</ns2:vatNumber>
<ns2:requestDate>2024-05-01+02:00</ns2:requestDate><ns2:valid>true</ns2:valid>
<ns2:name>Acme &amp; Sons GmbH</ns2:name><ns2:address>Ringstrasse 1
1010 Wien</ns2:address></ns2:checkVatResponse></soap:Body></soap:Envelope>"#;

    const INVALID_INPUT: &str = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body>
<soap:Fault><faultcode>soap:Server</faultcode><faultstring>INVALID_INPUT</faultstring></soap:Fault>
</soap:Body></soap:Envelope>"#;

    fn client(server: &MockServer) -> ViesClient {
        ViesClient::new(&ViesSettings {
            endpoint: format!("{}/vies", server.uri()),
            attempts: 1,
            attempt_timeout: Duration::from_secs(2),
            backoff: Duration::from_millis(1),
        })
        .unwrap()
    }

    #[test]
    fn valid_responses_become_flat_maps() {
        let VatCheck::Valid(detail) = ResponseParser::new().unwrap().parse(VALID).unwrap() else {
            panic!("expected valid");
        };
        assert_eq!(detail["name"], "Acme & Sons GmbH");
        assert_eq!(detail["address"], "Ringstrasse 1\n1010 Wien");
        assert_eq!(detail["countryCode"], "AT");
    }

    #[test]
    fn false_flag_is_not_valid() {
        let body = VALID.replace("<ns2:valid>true</ns2:valid>", "<ns2:valid>false</ns2:valid>");
        assert_eq!(ResponseParser::new().unwrap().parse(&body), Ok(VatCheck::NotValid));
    }

    #[tokio::test]
    async fn sends_a_check_vat_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("<urn:countryCode>AT</urn:countryCode>"))
            .and(body_string_contains("<urn:vatNumber>U12345678</urn:vatNumber>"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID))
            .expect(1)
            .mount(&server)
            .await;

        let got = client(&server).check_vat("AT", "U12345678").await.unwrap();
        assert!(matches!(got, VatCheck::Valid(_)));
    }

    #[tokio::test]
    async fn invalid_input_fault_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string(INVALID_INPUT))
            .mount(&server)
            .await;
        assert_eq!(
            client(&server).check_vat("DE", "1").await,
            Err(AuthorityError::InvalidInput)
        );
    }

    #[tokio::test]
    async fn bare_server_errors_are_transport_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;
        assert!(matches!(
            client(&server).check_vat("DE", "123456789").await,
            Err(AuthorityError::Transport(_))
        ));
    }
}
